//! # Step Model
//!
//! A step is either a processing command (`driver` payload) or a reference to
//! existing input files (`input` payload). Steps never point back at their work
//! item: anything that needs sibling steps or inherited attributes receives the
//! owning [`WorkItem`](super::WorkItem) and the step index explicitly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::constants::CONDITIONS_ALIAS_PREFIX;

/// GPU usage policy of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuRequirement {
    #[default]
    Forbidden,
    Optional,
    Required,
}

/// GPU requirements forwarded to the batch service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuParams {
    pub requires: GpuRequirement,
    pub gpu_memory: String,
    pub cuda_capabilities: Vec<String>,
    pub cuda_runtime: String,
    pub gpu_name: String,
    pub cuda_driver_version: String,
    pub cuda_runtime_version: String,
}

impl GpuParams {
    pub fn is_requested(&self) -> bool {
        matches!(
            self.requires,
            GpuRequirement::Optional | GpuRequirement::Required
        )
    }

    /// Names of mandatory parameters that are still empty
    pub fn missing_parameters(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.gpu_memory.trim().is_empty() {
            missing.push("gpu_memory");
        }
        if self.cuda_capabilities.iter().all(|c| c.trim().is_empty()) {
            missing.push("cuda_capabilities");
        }
        if self.cuda_runtime.trim().is_empty() {
            missing.push("cuda_runtime");
        }
        missing
    }

    /// Parameter dictionary in the shape the batch service expects
    pub fn to_batch_params(&self) -> Value {
        let mut params = serde_json::Map::new();
        params.insert("GPUMemoryMB".to_string(), parse_number_or_string(&self.gpu_memory));
        params.insert(
            "CUDACapabilities".to_string(),
            Value::from(self.cuda_capabilities.clone()),
        );
        params.insert("CUDARuntime".to_string(), Value::from(self.cuda_runtime.clone()));
        for (key, value) in [
            ("GPUName", &self.gpu_name),
            ("CUDADriverVersion", &self.cuda_driver_version),
            ("CUDARuntimeVersion", &self.cuda_runtime_version),
        ] {
            if !value.is_empty() {
                params.insert(key.to_string(), Value::from(value.clone()));
            }
        }
        Value::Object(params)
    }
}

fn parse_number_or_string(value: &str) -> Value {
    value
        .trim()
        .parse::<u64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(value.to_string()))
}

/// Processing command arguments. Field names follow the command line option they
/// render to; anything without a dedicated field lives in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverArgs {
    pub beamspot: String,
    pub conditions: String,
    pub customise: String,
    pub customise_commands: String,
    pub data: bool,
    pub datamix: String,
    pub datatier: Vec<String>,
    pub era: String,
    pub eventcontent: Vec<String>,
    pub extra: String,
    pub fast: bool,
    pub filetype: String,
    /// Generator fragment used as the first positional argument
    pub fragment_name: String,
    pub geometry: String,
    #[serde(rename = "hltProcess")]
    pub hlt_process: String,
    #[serde(rename = "inputCommands")]
    pub input_commands: String,
    pub mc: bool,
    #[serde(rename = "nStreams")]
    pub n_streams: u32,
    pub number: String,
    #[serde(rename = "outputCommand")]
    pub output_command: String,
    pub pileup: String,
    pub pileup_input: String,
    #[serde(rename = "procModifiers")]
    pub proc_modifiers: String,
    pub process: String,
    /// `"<events>,<events per job>"`
    pub relval: String,
    #[serde(rename = "runUnscheduled")]
    pub run_unscheduled: bool,
    pub scenario: String,
    pub step: Vec<String>,
}

/// Option name and kind of every dedicated [`DriverArgs`] field, in render order
pub(crate) const DRIVER_OPTIONS: &[(&str, DriverOptionKind)] = &[
    ("step", DriverOptionKind::List),
    ("conditions", DriverOptionKind::Text),
    ("beamspot", DriverOptionKind::Text),
    ("customise", DriverOptionKind::Text),
    ("customise_commands", DriverOptionKind::Text),
    ("data", DriverOptionKind::Flag),
    ("datamix", DriverOptionKind::Text),
    ("datatier", DriverOptionKind::List),
    ("era", DriverOptionKind::Text),
    ("eventcontent", DriverOptionKind::List),
    ("fast", DriverOptionKind::Flag),
    ("filetype", DriverOptionKind::Text),
    ("geometry", DriverOptionKind::Text),
    ("hltProcess", DriverOptionKind::Text),
    ("inputCommands", DriverOptionKind::Text),
    ("mc", DriverOptionKind::Flag),
    ("nStreams", DriverOptionKind::Count),
    ("number", DriverOptionKind::Text),
    ("outputCommand", DriverOptionKind::Text),
    ("pileup", DriverOptionKind::Text),
    ("pileup_input", DriverOptionKind::Text),
    ("procModifiers", DriverOptionKind::Text),
    ("process", DriverOptionKind::Text),
    ("relval", DriverOptionKind::Text),
    ("runUnscheduled", DriverOptionKind::Flag),
    ("scenario", DriverOptionKind::Text),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverOptionKind {
    Text,
    List,
    Flag,
    Count,
}

impl DriverArgs {
    /// Whether `option` has a dedicated field
    pub fn is_known_option(option: &str) -> bool {
        DRIVER_OPTIONS.iter().any(|(name, _)| *name == option)
    }

    /// Set a dedicated field from a loosely typed value. Returns `false` when the
    /// option has no dedicated field.
    pub fn set_option(&mut self, option: &str, value: &Value) -> bool {
        let text = || match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            Value::Array(items) => items
                .iter()
                .map(value_to_text)
                .collect::<Vec<_>>()
                .join(","),
            other => other.to_string(),
        };
        let list = || match value {
            Value::Array(items) => items
                .iter()
                .map(value_to_text)
                .filter(|s| !s.is_empty())
                .collect(),
            _ => split_list(&text()),
        };
        let flag = || match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::String(s) => !s.is_empty() && s != "false",
            _ => true,
        };

        match option {
            "beamspot" => self.beamspot = text(),
            "conditions" => self.conditions = text(),
            "customise" => self.customise = text(),
            "customise_commands" => self.customise_commands = text(),
            "data" => self.data = flag(),
            "datamix" => self.datamix = text(),
            "datatier" => self.datatier = list(),
            "era" => self.era = text(),
            "eventcontent" => self.eventcontent = list(),
            "fast" => self.fast = flag(),
            "filetype" => self.filetype = text(),
            "fragment_name" => self.fragment_name = text(),
            "geometry" => self.geometry = text(),
            "hltProcess" => self.hlt_process = text(),
            "inputCommands" => self.input_commands = text(),
            "mc" => self.mc = flag(),
            "nStreams" => self.n_streams = text().trim().parse().unwrap_or(0),
            "number" | "n" => self.number = text(),
            "outputCommand" => self.output_command = text(),
            "pileup" => self.pileup = text(),
            "pileup_input" => self.pileup_input = text(),
            "procModifiers" => self.proc_modifiers = text(),
            "process" => self.process = text(),
            "relval" => self.relval = text(),
            "runUnscheduled" => self.run_unscheduled = flag(),
            "scenario" => self.scenario = text(),
            "step" => self.step = list(),
            _ => return false,
        }
        true
    }

    /// Rendered `--option value` pairs, in a stable order
    pub fn options(&self) -> Vec<String> {
        let mut rendered = Vec::new();
        for (name, kind) in DRIVER_OPTIONS {
            let value = match (*name, kind) {
                (_, DriverOptionKind::Flag) => {
                    if self.flag(name) {
                        rendered.push(format!("--{name}"));
                    }
                    continue;
                }
                ("nStreams", _) => {
                    if self.n_streams > 0 {
                        rendered.push(format!("--nStreams {}", self.n_streams));
                    }
                    continue;
                }
                (_, DriverOptionKind::List) => self.list(name).join(","),
                _ => self.text(name).to_string(),
            };
            if !value.is_empty() {
                rendered.push(format!("--{name} {}", quote_if_needed(&value)));
            }
        }
        if !self.extra.trim().is_empty() {
            rendered.push(self.extra.trim().to_string());
        }
        rendered
    }

    fn flag(&self, name: &str) -> bool {
        match name {
            "data" => self.data,
            "fast" => self.fast,
            "mc" => self.mc,
            "runUnscheduled" => self.run_unscheduled,
            _ => false,
        }
    }

    fn list(&self, name: &str) -> &[String] {
        match name {
            "step" => &self.step,
            "datatier" => &self.datatier,
            "eventcontent" => &self.eventcontent,
            _ => &[],
        }
    }

    fn text(&self, name: &str) -> &str {
        match name {
            "beamspot" => &self.beamspot,
            "conditions" => &self.conditions,
            "customise" => &self.customise,
            "customise_commands" => &self.customise_commands,
            "datamix" => &self.datamix,
            "era" => &self.era,
            "filetype" => &self.filetype,
            "geometry" => &self.geometry,
            "hltProcess" => &self.hlt_process,
            "inputCommands" => &self.input_commands,
            "number" => &self.number,
            "outputCommand" => &self.output_command,
            "pileup" => &self.pileup,
            "pileup_input" => &self.pileup_input,
            "procModifiers" => &self.proc_modifiers,
            "process" => &self.process,
            "relval" => &self.relval,
            "scenario" => &self.scenario,
            _ => "",
        }
    }

    /// Step names without their `:sequence` part
    pub fn step_names(&self) -> Vec<&str> {
        self.step
            .iter()
            .map(|s| s.split(':').next().unwrap_or_default())
            .collect()
    }

    pub fn is_harvesting(&self) -> bool {
        self.step_names().iter().any(|s| *s == "HARVESTING")
    }

    /// Calibration-only steps run nothing but ALCA sequences
    pub fn is_alca_only(&self) -> bool {
        let names = self.step_names();
        !names.is_empty() && names.iter().all(|s| *s == "ALCA")
    }

    pub fn uses_conditions_alias(&self) -> bool {
        self.conditions.starts_with(CONDITIONS_ALIAS_PREFIX)
    }

    /// Pileup dataset name without a `dbs:`-style source prefix
    pub fn pileup_dataset(&self) -> Option<&str> {
        let pileup = self.pileup_input.trim();
        if pileup.is_empty() {
            return None;
        }
        Some(pileup.find('/').map(|i| &pileup[i..]).unwrap_or(pileup))
    }

    /// `(events, events per job)` of the `relval` option
    pub fn relval_events(&self) -> Option<(u64, u64)> {
        let (events, per_job) = self.relval.split_once(',')?;
        Some((events.trim().parse().ok()?, per_job.trim().parse().ok()?))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Split a comma separated list, dropping empty entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn quote_if_needed(value: &str) -> String {
    if value.contains(char::is_whitespace) || value.contains(';') {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Reference to existing input files
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputDescriptor {
    pub dataset: String,
    /// Run number → inclusive lumisection ranges
    pub lumisection: BTreeMap<String, Vec<[u64; 2]>>,
    pub run: Vec<u64>,
    pub label: String,
    pub events: u64,
}

impl InputDescriptor {
    pub fn for_dataset(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Default::default()
        }
    }

    pub fn has_lumisections(&self) -> bool {
        self.lumisection.values().any(|ranges| !ranges.is_empty())
    }

    /// Primary dataset name, the first `/`-delimited segment
    pub fn primary_dataset(&self) -> &str {
        self.dataset
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
    }
}

/// Exactly one payload per step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPayload {
    Driver(DriverArgs),
    Input(InputDescriptor),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Empty means inherited from the work item
    #[serde(default)]
    pub cmssw_release: String,
    /// Empty means inherited from the work item
    #[serde(default)]
    pub scram_arch: String,
    #[serde(default)]
    pub lumis_per_job: String,
    #[serde(default)]
    pub events_per_lumi: String,
    #[serde(default)]
    pub keep_output: bool,
    #[serde(default)]
    pub gpu: GpuParams,
    /// Inline generator fragment, only allowed on the first step
    #[serde(default)]
    pub fragment: String,
    /// Concrete conditions tag written during approval
    #[serde(default)]
    pub resolved_globaltag: String,
    /// Hash of the uploaded configuration, written during submission
    #[serde(default)]
    pub config_id: String,
    #[serde(flatten)]
    pub payload: StepPayload,
}

impl Step {
    pub fn driver(name: impl Into<String>, args: DriverArgs) -> Self {
        Self::with_payload(name, StepPayload::Driver(args))
    }

    pub fn input(name: impl Into<String>, input: InputDescriptor) -> Self {
        Self::with_payload(name, StepPayload::Input(input))
    }

    fn with_payload(name: impl Into<String>, payload: StepPayload) -> Self {
        Self {
            name: name.into(),
            cmssw_release: String::new(),
            scram_arch: String::new(),
            lumis_per_job: String::new(),
            events_per_lumi: String::new(),
            keep_output: false,
            gpu: GpuParams::default(),
            fragment: String::new(),
            resolved_globaltag: String::new(),
            config_id: String::new(),
            payload,
        }
    }

    pub fn driver_args(&self) -> Option<&DriverArgs> {
        match &self.payload {
            StepPayload::Driver(args) => Some(args),
            StepPayload::Input(_) => None,
        }
    }

    pub fn driver_args_mut(&mut self) -> Option<&mut DriverArgs> {
        match &mut self.payload {
            StepPayload::Driver(args) => Some(args),
            StepPayload::Input(_) => None,
        }
    }

    pub fn input_descriptor(&self) -> Option<&InputDescriptor> {
        match &self.payload {
            StepPayload::Input(input) => Some(input),
            StepPayload::Driver(_) => None,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.payload, StepPayload::Input(_))
    }

    pub fn is_harvesting(&self) -> bool {
        self.driver_args().is_some_and(DriverArgs::is_harvesting)
    }

    pub fn is_alca_only(&self) -> bool {
        self.driver_args().is_some_and(DriverArgs::is_alca_only)
    }

    /// Whether the step runs the `name` sequence, e.g. `HLT` or `DIGI`
    pub fn has_step(&self, name: &str) -> bool {
        self.driver_args()
            .is_some_and(|args| args.step_names().iter().any(|s| *s == name))
    }

    /// Conditions to use: the resolved tag if approval wrote one
    pub fn globaltag(&self) -> &str {
        if !self.resolved_globaltag.is_empty() {
            return &self.resolved_globaltag;
        }
        self.driver_args()
            .map(|args| args.conditions.as_str())
            .unwrap_or_default()
    }

    /// Name used for identities when the work item has no explicit workflow name
    pub fn short_name(&self) -> String {
        match &self.payload {
            StepPayload::Input(input) => {
                let primary = input.primary_dataset();
                primary.strip_prefix("RelVal").unwrap_or(primary).to_string()
            }
            StepPayload::Driver(args) => {
                let fragment = args.fragment_name.trim();
                if fragment.is_empty() {
                    return self.name.clone();
                }
                let base = fragment.rsplit('/').next().unwrap_or(fragment);
                let mut short = base.strip_suffix(".py").unwrap_or(base);
                for suffix in ["_cfi", "_cff", "_cfg"] {
                    short = short.strip_suffix(suffix).unwrap_or(short);
                }
                short.to_string()
            }
        }
    }

    /// Output file of the `content_index`-th event content of a step at `step_index`
    pub fn output_file_name(step_index: usize, content_index: usize, content: &str) -> String {
        if content_index == 0 {
            format!("file:step{}.root", step_index + 1)
        } else {
            format!("file:step{}_in{}.root", step_index + 1, content)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reco_args() -> DriverArgs {
        DriverArgs {
            step: vec!["RAW2DIGI".into(), "RECO".into(), "DQM:@standard".into()],
            eventcontent: vec!["RECOSIM".into(), "DQM".into()],
            datatier: vec!["GEN-SIM-RECO".into(), "DQMIO".into()],
            conditions: "auto:phase1_2024_realistic".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_step_serializes_payload_under_its_kind() {
        let step = Step::driver("RECO", reco_args());
        let value = serde_json::to_value(&step).unwrap();
        assert!(value.get("driver").is_some());
        assert!(value.get("input").is_none());
        assert_eq!(value["driver"]["conditions"], "auto:phase1_2024_realistic");

        let parsed: Step = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, step);
    }

    #[test]
    fn test_input_step_from_json() {
        let step: Step = serde_json::from_value(json!({
            "name": "RunMinBias2024B",
            "input": {
                "dataset": "/MinimumBias/Run2024B-v1/RAW",
                "lumisection": {"379456": [[1, 10], [20, 30]]},
                "run": [379456]
            }
        }))
        .unwrap();

        let input = step.input_descriptor().unwrap();
        assert!(step.is_input());
        assert!(input.has_lumisections());
        assert_eq!(input.primary_dataset(), "MinimumBias");
    }

    #[test]
    fn test_harvesting_and_alca_detection() {
        let harvest = DriverArgs {
            step: vec!["HARVESTING:@standardValidation".into()],
            ..Default::default()
        };
        assert!(harvest.is_harvesting());
        assert!(!harvest.is_alca_only());

        let alca = DriverArgs {
            step: vec!["ALCA:TkAlMinBias".into()],
            ..Default::default()
        };
        assert!(alca.is_alca_only());
        assert!(!reco_args().is_alca_only());
    }

    #[test]
    fn test_short_name_strips_fragment_suffixes() {
        let step = Step::driver(
            "GEN-SIM",
            DriverArgs {
                fragment_name: "Configuration/Generator/python/TTbar_14TeV_TuneCP5_cfi.py".into(),
                ..Default::default()
            },
        );
        assert_eq!(step.short_name(), "TTbar_14TeV_TuneCP5");

        let step = Step::input(
            "input",
            InputDescriptor::for_dataset("/RelValZMM_14/CMSSW_14_0_0-140X-v1/GEN-SIM"),
        );
        assert_eq!(step.short_name(), "ZMM_14");
    }

    #[test]
    fn test_set_option_splits_lists_and_reports_unknown() {
        let mut args = DriverArgs::default();
        assert!(args.set_option("step", &json!("GEN,SIM")));
        assert!(args.set_option("nStreams", &json!("4")));
        assert!(args.set_option("fast", &json!(true)));
        assert!(!args.set_option("--customise_unknown", &json!("x")));
        assert_eq!(args.step, vec!["GEN", "SIM"]);
        assert_eq!(args.n_streams, 4);
        assert!(args.fast);
    }

    #[test]
    fn test_options_render_in_stable_order() {
        let mut args = reco_args();
        args.n_streams = 2;
        args.extra = "--no_output_compression".into();
        let rendered = args.options();
        assert_eq!(rendered[0], "--step RAW2DIGI,RECO,DQM:@standard");
        assert_eq!(rendered[1], "--conditions auto:phase1_2024_realistic");
        assert!(rendered.contains(&"--nStreams 2".to_string()));
        assert_eq!(rendered.last().unwrap(), "--no_output_compression");
    }

    #[test]
    fn test_gpu_missing_parameters() {
        let gpu = GpuParams {
            requires: GpuRequirement::Required,
            gpu_memory: "8000".into(),
            ..Default::default()
        };
        assert!(gpu.is_requested());
        assert_eq!(gpu.missing_parameters(), vec!["cuda_capabilities", "cuda_runtime"]);
    }

    #[test]
    fn test_output_file_names() {
        assert_eq!(Step::output_file_name(1, 0, "RECOSIM"), "file:step2.root");
        assert_eq!(Step::output_file_name(1, 1, "DQM"), "file:step2_inDQM.root");
    }

    #[test]
    fn test_pileup_dataset_strips_source_prefix() {
        let args = DriverArgs {
            pileup_input: "dbs:/RelValMinBias_14TeV/CMSSW_14_0_0-140X_mcRun3-v1/GEN-SIM".into(),
            ..Default::default()
        };
        assert_eq!(
            args.pileup_dataset(),
            Some("/RelValMinBias_14TeV/CMSSW_14_0_0-140X_mcRun3-v1/GEN-SIM")
        );
    }
}
