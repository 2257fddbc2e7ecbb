//! # Ticket Fan-out
//!
//! Turns one ticket into its sibling work items. The ticket's matrix workflows
//! are enumerated remotely once; every enumerated workflow becomes a work item
//! carrying the ticket's batch defaults. Creation is all or nothing: if any item
//! fails, the ones already created are deleted again, newest first.
//!
//! ## Recycling
//!
//! With `recycle_input_of` set, the steps before the named sequence are replaced
//! by one input step reading an existing dataset. The dataset either follows the
//! ticket's `rewrite_gt_string` literally or is looked up in the catalog from the
//! resolved conditions of the replaced step.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::context::SystemContext;
use super::controller::ItemController;
use crate::client::{EnumeratedStep, EnumeratedWorkflow};
use crate::constants::{history, CONDITIONS_ALIAS_PREFIX};
use crate::error::{RelvalError, Result};
use crate::logging::log_item_operation;
use crate::models::{DriverArgs, InputDescriptor, Step, StepPayload, Ticket, WithHistory, WorkItem};
use crate::state_machine::TicketStatus;

/// Arguments the matrix tooling emits that only make sense for local running
const DROPPED_ARGUMENTS: &[&str] = &["filein", "fileout", "lumiToProcess"];

const RECYCLED_SUFFIX: &str = "_Recycled";

#[derive(Debug)]
pub struct TicketFanout {
    context: Arc<SystemContext>,
    controller: Arc<ItemController>,
}

impl TicketFanout {
    pub fn new(context: Arc<SystemContext>, controller: Arc<ItemController>) -> Self {
        Self {
            context,
            controller,
        }
    }

    /// Create the work items of a ticket and return their ids
    pub async fn create_items_for_ticket(&self, ticket_prepid: &str, user: &str) -> Result<Vec<String>> {
        let _guard = self.context.locker.lock(ticket_prepid).await;
        let mut ticket = self.context.tickets.get_required(ticket_prepid).await?;
        if ticket.status != TicketStatus::New {
            return Err(RelvalError::invalid_transition(
                ticket_prepid,
                ticket.status,
                "create work items",
            ));
        }

        let workflows = self.context.enumerator.enumerate(&ticket).await?;
        info!(
            ticket = %ticket_prepid,
            workflows = workflows.len(),
            "🎫 FANOUT: Workflows enumerated"
        );

        let mut ordered: Vec<(&String, &EnumeratedWorkflow)> = workflows.iter().collect();
        ordered.sort_by(|(a, _), (b, _)| compare_workflow_ids(a, b));

        let mut items = Vec::with_capacity(ordered.len());
        for (workflow_id, workflow) in ordered {
            items.push(self.item_from_workflow(&ticket, workflow_id, workflow).await?);
        }

        if !ticket.recycle_input_of.is_empty() {
            if ticket.rewrite_gt_string.is_empty() {
                self.recycle_from_catalog(&mut items, &ticket.recycle_input_of)
                    .await?;
            } else {
                recycle_with_rewrite(&mut items, &ticket.rewrite_gt_string, &ticket.recycle_input_of)?;
            }
        }

        let mut created: Vec<String> = Vec::with_capacity(items.len());
        let result = async {
            for item in items {
                let item = self.controller.create_item(item, user).await?;
                debug!(ticket = %ticket_prepid, prepid = %item.prepid, "🎫 FANOUT: Created work item");
                created.push(item.prepid);
            }
            ticket.created_relvals = created.clone();
            ticket.status = TicketStatus::Done;
            ticket.add_history(history::CREATED_RELVALS, created.clone(), None);
            self.context.tickets.save(&ticket).await
        }
        .await;

        if let Err(e) = result {
            error!(
                ticket = %ticket_prepid,
                error = %e,
                created = created.len(),
                "🎫 FANOUT: Creating work items failed, rolling back"
            );
            for prepid in created.iter().rev() {
                if let Err(delete_error) = self.controller.delete_item(prepid, user).await {
                    error!(prepid = %prepid, error = %delete_error, "🎫 FANOUT: Rollback delete failed");
                }
            }
            return Err(e);
        }

        log_item_operation(
            "create_items_for_ticket",
            ticket_prepid,
            &ticket.status.to_string(),
            Some(&created.join(",")),
        );
        Ok(created)
    }

    async fn item_from_workflow(
        &self,
        ticket: &Ticket,
        workflow_id: &str,
        workflow: &EnumeratedWorkflow,
    ) -> Result<WorkItem> {
        let mut steps = Vec::with_capacity(workflow.steps.len());
        for raw in &workflow.steps {
            let mut step = make_step(raw);
            apply_ticket_defaults(&mut step, ticket);
            if !ticket.rewrite_gt_string.is_empty() {
                self.rewrite_base_dataset(workflow_id, &mut step, &ticket.rewrite_gt_string)
                    .await?;
            }
            steps.push(step);
        }

        let mut item = WorkItem::new(ticket.release(), ticket.batch_name.clone(), steps);
        item.scram_arch = ticket.scram_arch.clone();
        item.cpu_cores = ticket.cpu_cores;
        item.memory = ticket.memory;
        item.label = ticket.label.clone();
        item.matrix = ticket.matrix.clone();
        item.sample_tag = ticket.sample_tag.clone();
        item.workflow_id = workflow_id.parse().map_err(|_| {
            RelvalError::Validation(format!("Enumerated workflow id {workflow_id} is not a number"))
        })?;
        item.workflow_name = workflow.workflow_name.clone();
        Ok(item)
    }

    /// Replace the middle part of the input dataset or pileup input and pick the
    /// newest matching dataset from the catalog
    async fn rewrite_base_dataset(&self, workflow_id: &str, step: &mut Step, rewrite: &str) -> Result<()> {
        match &mut step.payload {
            StepPayload::Input(input) if !input.dataset.is_empty() => {
                let pattern = replace_processed_name(&input.dataset, rewrite);
                debug!(dataset = %input.dataset, pattern = %pattern, "🎫 FANOUT: Rewriting input dataset");
                input.dataset = self.newest_dataset(&pattern).await?.ok_or_else(|| {
                    RelvalError::NotFound(format!(
                        "Could not find {pattern} input dataset for {workflow_id} after applying {rewrite} GT rewrite"
                    ))
                })?;
            }
            StepPayload::Driver(args) if !args.pileup_input.trim().is_empty() => {
                let pileup_input = args.pileup_input.trim().to_string();
                let (source, dataset) = match pileup_input.find('/') {
                    Some(index) => pileup_input.split_at(index),
                    None => ("", pileup_input.as_str()),
                };
                let pattern = replace_processed_name(dataset, &pileup_rewrite(rewrite));
                debug!(pileup = %pileup_input, pattern = %pattern, "🎫 FANOUT: Rewriting pileup input");
                let newest = self.newest_dataset(&pattern).await?.ok_or_else(|| {
                    RelvalError::NotFound(format!("Could not find {pattern} PU dataset for {workflow_id}"))
                })?;
                args.pileup_input = format!("{source}{newest}");
            }
            _ => {}
        }
        Ok(())
    }

    async fn newest_dataset(&self, pattern: &str) -> Result<Option<String>> {
        let mut datasets = self.context.catalog.list_datasets(pattern).await?;
        datasets.sort();
        Ok(datasets.pop())
    }

    /// Recycle input by resolving the replaced step's conditions and looking up
    /// the dataset it produced
    async fn recycle_from_catalog(&self, items: &mut [WorkItem], recycle_input_of: &str) -> Result<()> {
        let selected: Vec<(usize, usize)> = items
            .iter()
            .enumerate()
            .filter_map(|(item_index, item)| {
                recycled_step_index(item, recycle_input_of).map(|step_index| (item_index, step_index))
            })
            .collect();

        // (release, arch) → aliases, resolved in one batch per pair
        let mut aliases: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for &(item_index, step_index) in &selected {
            let item = &items[item_index];
            let conditions = driver_of(item, step_index)?.conditions.clone();
            if conditions.starts_with(CONDITIONS_ALIAS_PREFIX) {
                aliases
                    .entry((
                        item.step_release(step_index).to_string(),
                        item.step_scram_arch(step_index).to_string(),
                    ))
                    .or_default()
                    .insert(conditions);
            }
        }
        let mut resolved: BTreeMap<(String, String), _> = BTreeMap::new();
        for ((release, arch), wanted) in aliases {
            let tags = self
                .context
                .resolver
                .resolve_aliases(&release, &arch, &wanted)
                .await?;
            resolved.insert((release, arch), tags);
        }

        for (item_index, step_index) in selected {
            let item = &mut items[item_index];
            let release = item.step_release(step_index).to_string();
            let arch = item.step_scram_arch(step_index).to_string();
            let args = driver_of(item, step_index)?;
            let conditions = match resolved.get(&(release.clone(), arch)) {
                Some(tags) if args.uses_conditions_alias() => tags
                    .get(&args.conditions)
                    .cloned()
                    .unwrap_or_else(|| args.conditions.clone()),
                _ => args.conditions.clone(),
            };
            let datatier = last_datatier(item, step_index)?;

            item.steps[step_index].resolved_globaltag = conditions;
            let processing_string = item.processing_string(step_index);
            item.steps[step_index].resolved_globaltag.clear();

            let name = item.name();
            let pattern = format!("/RelVal{name}/{release}-{processing_string}-v*/{datatier}");
            debug!(workflow_id = item.workflow_id, pattern = %pattern, "🎫 FANOUT: Looking up recyclable input");
            let dataset = self.newest_dataset(&pattern).await?.ok_or_else(|| {
                RelvalError::NotFound(format!(
                    "Could not find a recyclable input for {name} ({}), query: {pattern}, step: {recycle_input_of}",
                    item.workflow_id
                ))
            })?;

            let mut input_step = input_step_from(&item.steps[step_index], dataset);
            input_step.name.push_str(RECYCLED_SUFFIX);
            replace_leading_steps(item, step_index, input_step);
        }
        Ok(())
    }
}

/// Numeric workflow id order, text order for anything unparsable
fn compare_workflow_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y),
        _ => a.cmp(b),
    }
}

/// Translate one enumerated step into a step of a work item
pub fn make_step(raw: &EnumeratedStep) -> Step {
    let name = raw.name.strip_suffix("INPUT").unwrap_or(raw.name.as_str()).to_string();

    let mut step = match raw.input.as_ref().filter(|input| !input.dataset.is_empty()) {
        Some(input) => Step::input(name, input.clone()),
        None => {
            let mut args = DriverArgs::default();
            let mut extra = Vec::new();
            for (key, value) in &raw.arguments {
                let option = key.trim_start_matches('-');
                if DROPPED_ARGUMENTS.contains(&option) || args.set_option(option, value) {
                    continue;
                }
                if let Some(rendered) = render_extra_argument(option, value) {
                    extra.push(rendered);
                }
            }
            args.extra = extra.join(" ");
            Step::driver(name, args)
        }
    };
    step.lumis_per_job = raw.lumis_per_job.clone();
    step.events_per_lumi = raw.events_per_lumi.clone();
    step
}

fn render_extra_argument(option: &str, value: &Value) -> Option<String> {
    match value {
        Value::Bool(true) => Some(format!("--{option}")),
        Value::Array(items) if !items.is_empty() => {
            let joined: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Some(format!("--{option} {}", joined.join(",")))
        }
        Value::String(s) if !s.is_empty() => Some(format!("--{option} {s}")),
        Value::Number(n) => Some(format!("--{option} {n}")),
        _ => None,
    }
}

/// Streams, GPU parameters and event scaling from the ticket
fn apply_ticket_defaults(step: &mut Step, ticket: &Ticket) {
    let Some(args) = step.driver_args_mut() else {
        return;
    };
    if ticket.n_streams > 0 {
        args.n_streams = ticket.n_streams;
    }
    if let Some((events, per_job)) = args.relval_events() {
        args.relval = format!("{},{per_job}", scale_events(events, ticket.events_factor));
    }

    let uses_gpu = if ticket.gpu_steps.is_empty() {
        ticket.gpu.is_requested()
    } else {
        args.step_names()
            .iter()
            .any(|name| ticket.gpu_steps.iter().any(|gpu_step| gpu_step == name))
    };
    if uses_gpu {
        step.gpu = ticket.gpu.clone();
    }
}

/// `max(1, events * factor)`, truncating
pub fn scale_events(events: u64, factor: f64) -> u64 {
    ((events as f64 * factor) as u64).max(1)
}

/// `/primary/<rewrite>/tier`
fn replace_processed_name(dataset: &str, rewrite: &str) -> String {
    let mut parts: Vec<&str> = dataset.split('/').collect();
    if parts.len() > 2 {
        parts[2] = rewrite;
    }
    parts.join("/")
}

/// Pileup datasets carry no `PU_` marker and may have any version
fn pileup_rewrite(rewrite: &str) -> String {
    let rewrite = rewrite.replace("-PU_", "-");
    let mut parts: Vec<&str> = rewrite.split('-').collect();
    if let Some(last) = parts.last_mut().filter(|last| last.starts_with('v')) {
        *last = "v*";
    }
    parts.join("-")
}

/// Index of the step right before the first (non-first) step running `sequence`
fn recycled_step_index(item: &WorkItem, sequence: &str) -> Option<usize> {
    item.steps
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, step)| step.has_step(sequence))
        .map(|(index, _)| index - 1)
}

fn driver_of(item: &WorkItem, step_index: usize) -> Result<&DriverArgs> {
    item.steps[step_index].driver_args().ok_or_else(|| {
        RelvalError::Validation(format!(
            "Step {} of {} reads input files and cannot be recycled",
            item.steps[step_index].name,
            item.name()
        ))
    })
}

fn last_datatier(item: &WorkItem, step_index: usize) -> Result<String> {
    driver_of(item, step_index)?
        .datatier
        .last()
        .cloned()
        .ok_or_else(|| {
            RelvalError::Validation(format!(
                "Step {} of {} has no data tier to recycle",
                item.steps[step_index].name,
                item.name()
            ))
        })
}

/// The replaced step turned into an input step, keeping its other attributes
fn input_step_from(step: &Step, dataset: String) -> Step {
    let mut input_step = step.clone();
    input_step.payload = StepPayload::Input(InputDescriptor::for_dataset(dataset));
    input_step.resolved_globaltag.clear();
    input_step.config_id.clear();
    input_step
}

fn replace_leading_steps(item: &mut WorkItem, recycled_index: usize, input_step: Step) {
    let kept = item.steps.split_off(recycled_index + 1);
    item.steps = std::iter::once(input_step).chain(kept).collect();
}

/// Recycle input from a dataset named after the ticket's rewrite string
fn recycle_with_rewrite(items: &mut [WorkItem], rewrite: &str, recycle_input_of: &str) -> Result<()> {
    for item in items.iter_mut() {
        let Some(step_index) = recycled_step_index(item, recycle_input_of) else {
            continue;
        };
        let dataset = format!(
            "/RelVal{}/{rewrite}/{}",
            item.name(),
            last_datatier(item, step_index)?
        );
        debug!(workflow_id = item.workflow_id, dataset = %dataset, "🎫 FANOUT: Recycled input dataset");
        let input_step = input_step_from(&item.steps[step_index], dataset);
        replace_leading_steps(item, step_index, input_step);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_step(name: &str, arguments: Value) -> EnumeratedStep {
        EnumeratedStep {
            name: name.to_string(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn driver_step(sequences: &str, tier: &str) -> Step {
        make_step(&raw_step(
            sequences,
            json!({"--step": sequences, "--eventcontent": tier, "--datatier": tier,
                   "--conditions": "auto:phase1_2024_realistic"}),
        ))
    }

    #[test]
    fn test_make_step_splits_and_moves_unknown_arguments() {
        let step = make_step(&raw_step(
            "DIGIPUINPUT",
            json!({
                "--step": "DIGI:pdigi_valid,L1,DIGI2RAW",
                "--eventcontent": "FEVTDEBUGHLT",
                "--datatier": "GEN-SIM-DIGI-RAW",
                "--filein": "file:step1.root",
                "--fileout": "file:step2.root",
                "--lumiToProcess": "step1_lumi_ranges.txt",
                "--nThreads": 8,
                "--no_exec": true,
                "--dump": false,
            }),
        ));
        assert_eq!(step.name, "DIGIPU");
        let args = step.driver_args().unwrap();
        assert_eq!(args.step, vec!["DIGI:pdigi_valid", "L1", "DIGI2RAW"]);
        assert_eq!(args.datatier, vec!["GEN-SIM-DIGI-RAW"]);
        assert_eq!(args.extra, "--nThreads 8 --no_exec");
        assert!(!args.options().iter().any(|o| o.contains("filein")));
    }

    #[test]
    fn test_input_steps_keep_their_descriptor() {
        let mut raw = raw_step("ZMM_14INPUT", json!({}));
        raw.input = Some(InputDescriptor::for_dataset("/RelValZMM_14/CMSSW_14_0_0-v1/GEN-SIM"));
        let step = make_step(&raw);
        assert_eq!(step.name, "ZMM_14");
        assert!(step.is_input());
    }

    #[test]
    fn test_ticket_defaults_scale_events_and_assign_gpu() {
        let mut ticket = Ticket::new("CMSSW_14_0_0", "fullsim");
        ticket.events_factor = 0.5;
        ticket.n_streams = 2;
        ticket.gpu.requires = crate::models::GpuRequirement::Optional;
        ticket.gpu_steps = vec!["RECO".to_string()];

        let mut gen = make_step(&raw_step("GEN", json!({"--step": "GEN,SIM", "--relval": "9000,100"})));
        apply_ticket_defaults(&mut gen, &ticket);
        assert_eq!(gen.driver_args().unwrap().relval, "4500,100");
        assert_eq!(gen.driver_args().unwrap().n_streams, 2);
        assert!(!gen.gpu.is_requested());

        let mut reco = make_step(&raw_step("RECO", json!({"--step": "RAW2DIGI,RECO:reconstruction"})));
        apply_ticket_defaults(&mut reco, &ticket);
        assert!(reco.gpu.is_requested());
    }

    #[test]
    fn test_scaled_events_never_reach_zero() {
        assert_eq!(scale_events(10, 0.01), 1);
        assert_eq!(scale_events(9000, 2.0), 18000);
    }

    #[test]
    fn test_pileup_rewrite_drops_marker_and_version() {
        assert_eq!(
            pileup_rewrite("CMSSW_14_0_0-PU_140X_mcRun3-v2"),
            "CMSSW_14_0_0-140X_mcRun3-v*"
        );
        assert_eq!(
            replace_processed_name("/RelValMinBias/CMSSW_13_0_0-130X-v1/GEN-SIM", "X-v*"),
            "/RelValMinBias/X-v*/GEN-SIM"
        );
    }

    #[test]
    fn test_recycling_with_rewrite_replaces_leading_steps() {
        let mut item = WorkItem::new(
            "CMSSW_14_0_0",
            "fullsim",
            vec![
                driver_step("GEN,SIM", "GEN-SIM"),
                driver_step("DIGI,L1,DIGI2RAW,HLT", "GEN-SIM-DIGI-RAW"),
                driver_step("RAW2DIGI,RECO", "AODSIM"),
            ],
        );
        item.workflow_name = "TTbar_14TeV".to_string();
        let mut items = vec![item];
        recycle_with_rewrite(&mut items, "CMSSW_14_0_0-140X_v1-v1", "RECO").unwrap();

        let steps = &items[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[0].input_descriptor().unwrap().dataset,
            "/RelValTTbar_14TeV/CMSSW_14_0_0-140X_v1-v1/GEN-SIM-DIGI-RAW"
        );
        assert!(steps[1].has_step("RECO"));
    }

    #[test]
    fn test_workflow_ids_order_numerically() {
        let mut ids = vec!["11634.911", "250.0", "1.1", "11634.0"];
        ids.sort_by(|a, b| compare_workflow_ids(a, b));
        assert_eq!(ids, vec!["1.1", "250.0", "11634.0", "11634.911"]);
    }
}
