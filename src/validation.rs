//! Input validation for work items, steps and tickets
//!
//! Every document kind has a declarative table of `(field, predicate, message)`
//! rules. Structural invariants that span several fields (input step placement,
//! fragment placement) are checked separately after the tables.

use crate::error::{RelvalError, Result};
use crate::models::{DriverArgs, InputDescriptor, Step, StepPayload, Ticket, WorkItem};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum length of a generated identity
pub const MAX_PREPID_LENGTH: usize = 150;

/// Maximum number of steps in one work item
pub const MAX_STEPS: usize = 20;

/// One declarative validation rule
pub struct FieldRule<T: ?Sized> {
    pub field: &'static str,
    pub check: fn(&T) -> bool,
    pub message: &'static str,
}

fn pattern(cell: &'static OnceLock<Regex>, expression: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(expression).expect("static validation pattern compiles"))
}

fn release_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^CMSSW_\d{1,3}_\d{1,3}_\d{1,3}(_[a-zA-Z0-9]{1,30})*$")
}

fn name_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^[a-zA-Z0-9_\-]{1,80}$")
}

fn optional_name_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^[a-zA-Z0-9_\-]{0,80}$")
}

fn scram_arch_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^([a-z0-9]{1,10}_[a-z0-9]{1,10}_[a-z0-9]{1,15})?$")
}

fn dataset_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r"^/[a-zA-Z0-9\-_]{1,99}/[a-zA-Z0-9\.\-_]{1,199}/[A-Z0-9\-]{1,50}$",
    )
}

fn conditions_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^(auto:)?[a-zA-Z0-9_]{0,150}$")
}

fn relval_events_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^(\d+,\d+)?$")
}

fn is_release(value: &str) -> bool {
    release_regex().is_match(value)
}

fn is_optional_release(value: &str) -> bool {
    value.is_empty() || is_release(value)
}

pub const WORK_ITEM_RULES: &[FieldRule<WorkItem>] = &[
    FieldRule {
        field: "cmssw_release",
        check: |item| is_release(&item.cmssw_release),
        message: "must look like CMSSW_X_Y_Z",
    },
    FieldRule {
        field: "batch_name",
        check: |item| name_regex().is_match(&item.batch_name),
        message: "must be 1-80 letters, digits, '_' or '-'",
    },
    FieldRule {
        field: "scram_arch",
        check: |item| scram_arch_regex().is_match(&item.scram_arch),
        message: "must look like os_arch_compiler",
    },
    FieldRule {
        field: "cpu_cores",
        check: |item| (1..=64).contains(&item.cpu_cores),
        message: "must be between 1 and 64",
    },
    FieldRule {
        field: "memory",
        check: |item| (1..=64_000).contains(&item.memory),
        message: "must be between 1 and 64000 MB",
    },
    FieldRule {
        field: "label",
        check: |item| optional_name_regex().is_match(&item.label),
        message: "may only contain letters, digits, '_' or '-'",
    },
    FieldRule {
        field: "sample_tag",
        check: |item| optional_name_regex().is_match(&item.sample_tag),
        message: "may only contain letters, digits, '_' or '-'",
    },
    FieldRule {
        field: "workflow_id",
        check: |item| item.workflow_id >= 0.0 && item.workflow_id.is_finite(),
        message: "must be a non-negative number",
    },
    FieldRule {
        field: "workflow_name",
        check: |item| optional_name_regex().is_match(&item.workflow_name),
        message: "may only contain letters, digits, '_' or '-'",
    },
    FieldRule {
        field: "steps",
        check: |item| !item.steps.is_empty() && item.steps.len() <= MAX_STEPS,
        message: "must contain between 1 and 20 steps",
    },
];

pub const STEP_RULES: &[FieldRule<Step>] = &[
    FieldRule {
        field: "name",
        check: |step| name_regex().is_match(&step.name.replace([',', ':', '@'], "_")),
        message: "must be 1-80 letters, digits, '_' or '-'",
    },
    FieldRule {
        field: "cmssw_release",
        check: |step| is_optional_release(&step.cmssw_release),
        message: "must be empty or look like CMSSW_X_Y_Z",
    },
    FieldRule {
        field: "scram_arch",
        check: |step| scram_arch_regex().is_match(&step.scram_arch),
        message: "must be empty or look like os_arch_compiler",
    },
    FieldRule {
        field: "lumis_per_job",
        check: |step| step.lumis_per_job.is_empty() || step.lumis_per_job.parse::<u64>().is_ok(),
        message: "must be empty or a number",
    },
    FieldRule {
        field: "events_per_lumi",
        check: |step| {
            step.events_per_lumi.is_empty() || step.events_per_lumi.parse::<u64>().is_ok()
        },
        message: "must be empty or a number",
    },
];

pub const DRIVER_RULES: &[FieldRule<DriverArgs>] = &[
    FieldRule {
        field: "driver.conditions",
        check: |args| conditions_regex().is_match(&args.conditions),
        message: "must be a tag name or an auto: alias",
    },
    FieldRule {
        field: "driver.step",
        check: |args| !args.step.is_empty(),
        message: "must list at least one sequence",
    },
    FieldRule {
        field: "driver.eventcontent",
        check: |args| !args.eventcontent.is_empty() || args.is_harvesting(),
        message: "must list at least one event content",
    },
    FieldRule {
        field: "driver.datatier",
        check: |args| args.datatier.len() == args.eventcontent.len(),
        message: "must have one data tier per event content",
    },
    FieldRule {
        field: "driver.relval",
        check: |args| relval_events_regex().is_match(&args.relval),
        message: "must be '<events>,<events per job>'",
    },
    FieldRule {
        field: "driver.pileup_input",
        check: |args| args.pileup_dataset().map_or(true, |d| dataset_regex().is_match(d)),
        message: "must be a dataset name",
    },
];

pub const INPUT_RULES: &[FieldRule<InputDescriptor>] = &[
    FieldRule {
        field: "input.dataset",
        check: |input| dataset_regex().is_match(&input.dataset),
        message: "must be a dataset name /primary/processed/TIER",
    },
    FieldRule {
        field: "input.lumisection",
        check: |input| {
            input
                .lumisection
                .iter()
                .all(|(run, ranges)| {
                    run.parse::<u64>().is_ok() && ranges.iter().all(|[from, to]| from <= to)
                })
        },
        message: "must map run numbers to increasing lumisection ranges",
    },
];

pub const TICKET_RULES: &[FieldRule<Ticket>] = &[
    FieldRule {
        field: "cmssw_release",
        check: |ticket| is_release(ticket.release()),
        message: "must look like CMSSW_X_Y_Z",
    },
    FieldRule {
        field: "batch_name",
        check: |ticket| name_regex().is_match(&ticket.batch_name),
        message: "must be 1-80 letters, digits, '_' or '-'",
    },
    FieldRule {
        field: "scram_arch",
        check: |ticket| scram_arch_regex().is_match(&ticket.scram_arch),
        message: "must look like os_arch_compiler",
    },
    FieldRule {
        field: "cpu_cores",
        check: |ticket| (1..=64).contains(&ticket.cpu_cores),
        message: "must be between 1 and 64",
    },
    FieldRule {
        field: "memory",
        check: |ticket| (1..=64_000).contains(&ticket.memory),
        message: "must be between 1 and 64000 MB",
    },
    FieldRule {
        field: "events_factor",
        check: |ticket| ticket.events_factor > 0.0 && ticket.events_factor <= 100.0,
        message: "must be greater than 0 and at most 100",
    },
    FieldRule {
        field: "n_streams",
        check: |ticket| ticket.n_streams <= 64,
        message: "must be at most 64",
    },
    FieldRule {
        field: "workflow_ids",
        check: |ticket| {
            !ticket.workflow_ids.is_empty() && ticket.workflow_ids.iter().all(|id| *id > 0.0)
        },
        message: "must list at least one positive workflow id",
    },
    FieldRule {
        field: "rewrite_gt_string",
        check: |ticket| optional_name_regex().is_match(&ticket.rewrite_gt_string.replace('.', "_")),
        message: "may only contain letters, digits, '.', '_' or '-'",
    },
];

fn apply_rules<T: ?Sized>(subject: &str, value: &T, rules: &[FieldRule<T>]) -> Result<()> {
    for rule in rules {
        if !(rule.check)(value) {
            return Err(RelvalError::Validation(format!(
                "Invalid {} of {}: {}",
                rule.field, subject, rule.message
            )));
        }
    }
    Ok(())
}

/// Validate a step against its field tables
pub fn validate_step(step: &Step) -> Result<()> {
    let subject = format!("step {}", step.name);
    apply_rules(&subject, step, STEP_RULES)?;
    match &step.payload {
        StepPayload::Driver(args) => apply_rules(&subject, args, DRIVER_RULES),
        StepPayload::Input(input) => apply_rules(&subject, input, INPUT_RULES),
    }
}

/// Validate a work item, all of its steps and the cross-step invariants
pub fn validate_work_item(item: &WorkItem) -> Result<()> {
    let subject = if item.prepid.is_empty() {
        "new work item".to_string()
    } else {
        item.prepid.clone()
    };
    apply_rules(&subject, item, WORK_ITEM_RULES)?;

    for (index, step) in item.steps.iter().enumerate() {
        validate_step(step)?;
        if index > 0 && step.is_input() {
            return Err(RelvalError::Validation(format!(
                "Step {} of {} is an input step, only the first step may be one",
                step.name, subject
            )));
        }
        if index > 0 && !step.fragment.is_empty() {
            return Err(RelvalError::Validation(format!(
                "Step {} of {} has a custom fragment, only the first step may have one",
                step.name, subject
            )));
        }
    }

    if item.identity_prefix().len() + 6 > MAX_PREPID_LENGTH {
        return Err(RelvalError::Validation(format!(
            "Identity of {subject} would be longer than {MAX_PREPID_LENGTH} characters"
        )));
    }

    Ok(())
}

pub fn validate_ticket(ticket: &Ticket) -> Result<()> {
    let subject = if ticket.prepid.is_empty() {
        "new ticket".to_string()
    } else {
        ticket.prepid.clone()
    };
    apply_rules(&subject, ticket, TICKET_RULES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen_sim() -> Step {
        Step::driver(
            "GenSim",
            DriverArgs {
                step: vec!["GEN".into(), "SIM".into()],
                eventcontent: vec!["FEVTDEBUG".into()],
                datatier: vec!["GEN-SIM".into()],
                conditions: "auto:phase1_2024_realistic".into(),
                relval: "9000,100".into(),
                fragment_name: "TTbar_14TeV_TuneCP5_cfi".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_valid_work_item() {
        let item = WorkItem::new("CMSSW_14_0_0_pre3", "fullsim", vec![gen_sim()]);
        assert!(validate_work_item(&item).is_ok());
    }

    #[test]
    fn test_rule_table_names_offending_field() {
        let item = WorkItem::new("14_0_0", "fullsim", vec![gen_sim()]);
        let err = validate_work_item(&item).unwrap_err();
        assert!(err.to_string().contains("cmssw_release"));
        assert!(err.is_validation());
    }

    #[test]
    fn test_input_step_must_be_first() {
        let input = Step::input(
            "ZMM",
            InputDescriptor::for_dataset("/RelValZMM/CMSSW_14_0_0-v1/GEN-SIM"),
        );
        let item = WorkItem::new("CMSSW_14_0_0", "b", vec![gen_sim(), input]);
        let err = validate_work_item(&item).unwrap_err();
        assert!(err.to_string().contains("only the first step"));
    }

    #[test]
    fn test_bad_dataset_rejected() {
        let input = Step::input("ZMM", InputDescriptor::for_dataset("RelValZMM"));
        let err = validate_step(&input).unwrap_err();
        assert!(err.to_string().contains("input.dataset"));
    }

    #[test]
    fn test_tier_count_must_match_contents() {
        let mut step = gen_sim();
        if let Some(args) = step.driver_args_mut() {
            args.datatier.push("DQMIO".into());
        }
        assert!(validate_step(&step).is_err());
    }

    #[test]
    fn test_ticket_requires_workflow_ids() {
        let ticket = Ticket::new("CMSSW_14_0_0", "fullsim");
        let err = validate_ticket(&ticket).unwrap_err();
        assert!(err.to_string().contains("workflow_ids"));
    }
}
