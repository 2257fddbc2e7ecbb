use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relval_core::config::BatchServiceConfig;
use relval_core::execution::{generation_script, job_description};
use relval_core::models::{OutputDataset, StatusEntry, WorkflowSummary};
use relval_core::orchestration::{make_step, select_output_datasets};
use relval_core::test_helpers::{enumerated_workflow, sample_item, TEST_GLOBALTAG};

fn workflows(count: usize) -> Vec<WorkflowSummary> {
    (0..count)
        .map(|i| WorkflowSummary {
            name: format!("pdmvserv_RVCMSSW_14_0_0ZMM__fullsim_240101_{i:06}_{:04}", i % 97),
            workflow_type: "TaskChain".to_string(),
            output_datasets: ["GEN-SIM", "GEN-SIM-RECO", "DQMIO", "NANOAODSIM"]
                .iter()
                .map(|tier| OutputDataset {
                    name: format!(
                        "/RelValZMM_14/CMSSW_14_0_0-{TEST_GLOBALTAG}-v{}/{tier}",
                        i % 5 + 1
                    ),
                    access_type: "VALID".to_string(),
                    events: 9000,
                })
                .collect(),
            status_history: vec![StatusEntry {
                time: i as i64,
                status: if i % 7 == 0 { "aborted" } else { "completed" }.to_string(),
            }],
        })
        .collect()
}

fn benchmark_output_selection(c: &mut Criterion) {
    let workflows = workflows(200);
    c.bench_function("select_output_datasets_200", |b| {
        b.iter(|| select_output_datasets(black_box(&workflows)))
    });
}

fn benchmark_generation_script(c: &mut Criterion) {
    let mut item = sample_item("ZMM");
    item.prepid = "CMSSW_14_0_0__fullsim-ZMM-00001".to_string();
    for step in &mut item.steps {
        step.resolved_globaltag = TEST_GLOBALTAG.to_string();
    }
    let batch_service = BatchServiceConfig::default();

    c.bench_function("generation_script", |b| {
        b.iter(|| generation_script(black_box(&item)))
    });
    c.bench_function("job_description", |b| {
        b.iter(|| job_description(black_box(&item), black_box(&batch_service)))
    });
}

fn benchmark_make_step(c: &mut Criterion) {
    let workflow = enumerated_workflow("ZMM");
    c.bench_function("make_step", |b| {
        b.iter(|| {
            workflow
                .steps
                .iter()
                .map(|raw| make_step(black_box(raw)))
                .count()
        })
    });
}

criterion_group!(
    benches,
    benchmark_output_selection,
    benchmark_generation_script,
    benchmark_make_step
);
criterion_main!(benches);
