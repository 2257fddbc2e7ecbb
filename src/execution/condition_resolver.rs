//! # Condition Alias Resolution
//!
//! `auto:` conditions aliases are only meaningful inside the environment of a
//! specific release, so they are resolved by running a small helper remotely.
//! Results are cached per `(release, scram arch, alias)` for a configurable TTL.
//!
//! Resolution of one `(release, scram arch)` pair happens under the
//! `resolve-conditions-<release>-<arch>` lock; the cache is checked again after
//! the lock is taken so that concurrent approvals share one remote call.

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::command_generator::environment_setup;
use crate::client::RemoteExecutor;
use crate::config::RemoteConfig;
use crate::constants::{lock_keys, CONDITIONS_ALIAS_PREFIX};
use crate::error::{RelvalError, Result};
use crate::locker::Locker;
use crate::models::WorkItem;

const RESOLVER_FILE_NAME: &str = "resolve_auto_global_tag.py";

const RESOLVER_SCRIPT: &str = r#"import sys
from Configuration.AlCa.autoCond import autoCond


def resolve(tag):
    if not tag.startswith('auto:'):
        return tag
    resolved = autoCond[tag.replace('auto:', '', 1)]
    if isinstance(resolved, (list, tuple)):
        resolved = resolved[0]
    return resolved


if len(sys.argv) < 2:
    print('usage: %s <auto:tag>[,<auto:tag2>]' % sys.argv[0])
    sys.exit(1)

for alias in [t.strip() for t in sys.argv[1].split(',') if t.strip()]:
    print('GlobalTag: %s %s' % (alias, resolve(alias)))
"#;

#[derive(Debug, Clone)]
struct CachedTag {
    tag: String,
    stored_at: Instant,
}

/// TTL cache of resolved aliases keyed by `(release, scram arch, alias)`
#[derive(Debug)]
pub struct ResolutionCache {
    entries: DashMap<(String, String, String), CachedTag>,
    ttl: Duration,
}

impl ResolutionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn key(release: &str, scram_arch: &str, alias: &str) -> (String, String, String) {
        (release.to_string(), scram_arch.to_string(), alias.to_string())
    }

    pub fn get(&self, release: &str, scram_arch: &str, alias: &str) -> Option<String> {
        let key = Self::key(release, scram_arch, alias);
        let cached = self.entries.get(&key).map(|entry| entry.value().clone())?;
        if self.is_expired(&cached) {
            self.remove_expired(&key);
            return None;
        }
        Some(cached.tag)
    }

    fn is_expired(&self, cached: &CachedTag) -> bool {
        cached.stored_at.elapsed() > self.ttl
    }

    /// Drop `key` only if its current entry is stale; a concurrent refresh wins
    fn remove_expired(&self, key: &(String, String, String)) {
        self.entries.remove_if(key, |_, cached| self.is_expired(cached));
    }

    pub fn insert(&self, release: &str, scram_arch: &str, alias: &str, tag: impl Into<String>) {
        self.entries.insert(
            Self::key(release, scram_arch, alias),
            CachedTag {
                tag: tag.into(),
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// `alias → tag` pairs printed by the resolver helper
pub fn parse_resolved_tags(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("GlobalTag:"))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            Some((parts.next()?.to_string(), parts.next()?.to_string()))
        })
        .collect()
}

pub struct ConditionResolver {
    executor: Arc<dyn RemoteExecutor>,
    cache: Arc<ResolutionCache>,
    locker: Arc<Locker>,
    remote: RemoteConfig,
}

impl std::fmt::Debug for ConditionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionResolver")
            .field("cached", &self.cache.len())
            .field("host", &self.remote.host)
            .finish()
    }
}

impl ConditionResolver {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        cache: Arc<ResolutionCache>,
        locker: Arc<Locker>,
        remote: RemoteConfig,
    ) -> Self {
        Self {
            executor,
            cache,
            locker,
            remote,
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Split `aliases` into cached tags and aliases still to resolve
    fn cached(
        &self,
        release: &str,
        scram_arch: &str,
        aliases: &BTreeSet<String>,
    ) -> (HashMap<String, String>, BTreeSet<String>) {
        let mut resolved = HashMap::new();
        let mut missing = BTreeSet::new();
        for alias in aliases {
            match self.cache.get(release, scram_arch, alias) {
                Some(tag) => {
                    resolved.insert(alias.clone(), tag);
                }
                None => {
                    missing.insert(alias.clone());
                }
            }
        }
        (resolved, missing)
    }

    /// Resolve `aliases` in the environment of `(release, scram_arch)`
    pub async fn resolve_aliases(
        &self,
        release: &str,
        scram_arch: &str,
        aliases: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>> {
        let (resolved, missing) = self.cached(release, scram_arch, aliases);
        if missing.is_empty() {
            debug!(release = %release, scram_arch = %scram_arch, "🏷️ CONDITIONS: All aliases cached");
            return Ok(resolved);
        }

        let _guard = self
            .locker
            .lock(&lock_keys::resolve_conditions(release, scram_arch))
            .await;

        // Someone else may have resolved them while we waited
        let (mut resolved, missing) = self.cached(release, scram_arch, aliases);
        if missing.is_empty() {
            return Ok(resolved);
        }

        let fetched = self.resolve_remotely(release, scram_arch, &missing).await?;
        for alias in &missing {
            let tag = fetched.get(alias).ok_or_else(|| {
                RelvalError::RemoteExecution(format!(
                    "Could not resolve {alias} in {release} ({scram_arch})"
                ))
            })?;
            self.cache.insert(release, scram_arch, alias, tag.clone());
            resolved.insert(alias.clone(), tag.clone());
        }
        Ok(resolved)
    }

    async fn resolve_remotely(
        &self,
        release: &str,
        scram_arch: &str,
        aliases: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>> {
        let directory = self
            .remote
            .workspace_for(&format!("conditions_{release}_{scram_arch}"));
        let alias_list = aliases.iter().cloned().collect::<Vec<_>>().join(",");
        info!(
            release = %release,
            scram_arch = %scram_arch,
            aliases = %alias_list,
            "🏷️ CONDITIONS: Resolving aliases remotely"
        );

        let mut commands = vec![format!("mkdir -p {directory}"), format!("cd {directory}")];
        commands.extend(environment_setup(release, scram_arch));
        commands.push(format!("cat > {RESOLVER_FILE_NAME} << 'EndOfResolver'"));
        commands.push(RESOLVER_SCRIPT.trim_end().to_string());
        commands.push("EndOfResolver".to_string());
        commands.push(format!("python3 {RESOLVER_FILE_NAME} \"{alias_list}\""));

        let session = self.executor.open_session().await?;
        let output = session.execute(&commands).await;
        session.close().await?;
        let output = output?;
        if !output.success() {
            return Err(RelvalError::RemoteExecution(format!(
                "Error resolving {alias_list} in {release}:\n{}",
                output.stderr.trim()
            )));
        }
        Ok(parse_resolved_tags(&output.stdout))
    }

    /// Write `resolved_globaltag` on every processing step of `item`.
    ///
    /// Aliases are batched per distinct `(release, scram arch)`; plain conditions
    /// are copied unchanged.
    pub async fn resolve_item(&self, item: &mut WorkItem) -> Result<()> {
        let mut requests: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for (index, step) in item.steps.iter().enumerate() {
            let Some(args) = step.driver_args() else {
                continue;
            };
            if args.uses_conditions_alias() {
                requests
                    .entry((
                        item.step_release(index).to_string(),
                        item.step_scram_arch(index).to_string(),
                    ))
                    .or_default()
                    .insert(args.conditions.trim().to_string());
            }
        }

        let mut resolved = HashMap::new();
        for ((release, scram_arch), aliases) in &requests {
            let tags = self.resolve_aliases(release, scram_arch, aliases).await?;
            for (alias, tag) in tags {
                resolved.insert((release.clone(), scram_arch.clone(), alias), tag);
            }
        }

        for index in 0..item.steps.len() {
            let release = item.step_release(index).to_string();
            let scram_arch = item.step_scram_arch(index).to_string();
            let step = &mut item.steps[index];
            let Some(args) = step.driver_args() else {
                continue;
            };
            let conditions = args.conditions.trim().to_string();
            step.resolved_globaltag = if conditions.starts_with(CONDITIONS_ALIAS_PREFIX) {
                resolved
                    .get(&(release, scram_arch, conditions.clone()))
                    .cloned()
                    .ok_or_else(|| {
                        RelvalError::RemoteExecution(format!("Could not resolve {conditions}"))
                    })?
            } else {
                conditions
            };
        }
        Ok(())
    }
}
