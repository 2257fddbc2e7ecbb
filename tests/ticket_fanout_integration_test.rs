//! Ticket Fan-out Integration Tests
//!
//! Creation of sibling work items from a ticket, including rollback and
//! recycled input lookup.

use relval_core::constants::history;
use relval_core::database::DocumentStore;
use relval_core::test_helpers::{
    enumerated_workflow, enumeration, sample_ticket, TestHarness, TEST_GLOBALTAG, TEST_USER,
};
use relval_core::{RelvalError, TicketStatus, WorkItemStatus};

#[tokio::test]
async fn test_items_follow_numeric_workflow_order() {
    let harness = TestHarness::new();
    harness.enumerator.set(enumeration(&[
        ("1.0", enumerated_workflow("ZMM")),
        ("11.0", enumerated_workflow("TTbar")),
        ("2.0", enumerated_workflow("QCD")),
    ]));
    let core = harness.core();

    let ticket = core
        .create_ticket(sample_ticket(&[1.0, 2.0, 11.0]), TEST_USER)
        .await
        .unwrap();
    let created = core
        .create_items_for_ticket(&ticket.prepid, TEST_USER)
        .await
        .unwrap();
    assert_eq!(
        created,
        vec![
            "CMSSW_14_0_0__fullsim-ZMM-00001".to_string(),
            "CMSSW_14_0_0__fullsim-QCD-00001".to_string(),
            "CMSSW_14_0_0__fullsim-TTbar-00001".to_string(),
        ]
    );
    assert_eq!(harness.enumerator.calls(), 1);

    let stored = harness.tickets.get_required(&ticket.prepid).await.unwrap();
    assert_eq!(stored.status, TicketStatus::Done);
    assert_eq!(stored.created_relvals, created);
    let entry = stored.history.last().unwrap();
    assert_eq!(entry.action, history::CREATED_RELVALS);

    let item = harness.items.get_required(&created[2]).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::New);
    assert_eq!(item.workflow_id, 11.0);
    assert_eq!(item.workflow_name, "TTbar");
    assert_eq!(item.label, "RV");
    assert_eq!(item.steps.len(), 2);
    assert_eq!(item.steps[1].name, "DIGIUP24_TTbar");
    let args = item.steps[0].driver_args().unwrap();
    assert!(!args.options().iter().any(|option| option.contains("fileout")));
    core.shutdown().await;
}

#[tokio::test]
async fn test_events_factor_scales_generated_events() {
    let harness = TestHarness::new();
    harness
        .enumerator
        .set(enumeration(&[("1.0", enumerated_workflow("ZMM"))]));
    let core = harness.core();

    let mut ticket = sample_ticket(&[1.0]);
    ticket.events_factor = 0.5;
    ticket.n_streams = 4;
    let ticket = core.create_ticket(ticket, TEST_USER).await.unwrap();
    let created = core
        .create_items_for_ticket(&ticket.prepid, TEST_USER)
        .await
        .unwrap();

    let item = harness.items.get_required(&created[0]).await.unwrap();
    let args = item.steps[0].driver_args().unwrap();
    assert_eq!(args.relval, "4500,100");
    assert_eq!(args.n_streams, 4);
    core.shutdown().await;
}

#[tokio::test]
async fn test_failed_item_rolls_back_whole_ticket() {
    let harness = TestHarness::new();
    let mut broken = enumerated_workflow("Broken");
    broken.workflow_name = "bad name!".to_string();
    harness.enumerator.set(enumeration(&[
        ("1.0", enumerated_workflow("ZMM")),
        ("2.0", enumerated_workflow("TTbar")),
        ("3.0", broken),
        ("4.0", enumerated_workflow("QCD")),
        ("5.0", enumerated_workflow("MinBias")),
    ]));
    let core = harness.core();

    let ticket = core
        .create_ticket(sample_ticket(&[1.0, 2.0, 3.0, 4.0, 5.0]), TEST_USER)
        .await
        .unwrap();
    let err = core
        .create_items_for_ticket(&ticket.prepid, TEST_USER)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(harness.items.is_empty());

    let stored = harness.tickets.get_required(&ticket.prepid).await.unwrap();
    assert_eq!(stored.status, TicketStatus::New);
    assert!(stored.created_relvals.is_empty());
    core.shutdown().await;
}

#[tokio::test]
async fn test_fanout_requires_new_ticket() {
    let harness = TestHarness::new();
    harness
        .enumerator
        .set(enumeration(&[("1.0", enumerated_workflow("ZMM"))]));
    let core = harness.core();

    let ticket = core.create_ticket(sample_ticket(&[1.0]), TEST_USER).await.unwrap();
    core.create_items_for_ticket(&ticket.prepid, TEST_USER)
        .await
        .unwrap();

    let err = core
        .create_items_for_ticket(&ticket.prepid, TEST_USER)
        .await
        .unwrap_err();
    assert!(matches!(err, RelvalError::InvalidTransition { .. }));
    assert_eq!(harness.items.len(), 1);
    assert_eq!(harness.enumerator.calls(), 1);
    core.shutdown().await;
}

#[tokio::test]
async fn test_recycled_input_uses_newest_catalog_dataset() {
    let harness = TestHarness::new();
    harness
        .enumerator
        .set(enumeration(&[("1.0", enumerated_workflow("ZMM"))]));
    let processed = format!("CMSSW_14_0_0-{TEST_GLOBALTAG}_RV");
    harness
        .catalog
        .insert(format!("/RelValZMM/{processed}-v1/GEN-SIM"), "VALID");
    harness
        .catalog
        .insert(format!("/RelValZMM/{processed}-v2/GEN-SIM"), "VALID");
    harness
        .catalog
        .insert(format!("/RelValZMM/{processed}-v3/GEN-SIM-RECO"), "VALID");
    let core = harness.core();

    let mut ticket = sample_ticket(&[1.0]);
    ticket.recycle_input_of = "DIGI".to_string();
    let ticket = core.create_ticket(ticket, TEST_USER).await.unwrap();
    let created = core
        .create_items_for_ticket(&ticket.prepid, TEST_USER)
        .await
        .unwrap();

    let item = harness.items.get_required(&created[0]).await.unwrap();
    assert_eq!(item.steps.len(), 2);
    let input = item.steps[0].input_descriptor().unwrap();
    assert_eq!(input.dataset, format!("/RelValZMM/{processed}-v2/GEN-SIM"));
    assert_eq!(item.steps[0].name, "ZMM_14_Recycled");
    assert!(item.steps[1].has_step("DIGI"));
    assert!(item.steps.iter().all(|step| step.resolved_globaltag.is_empty()));
    core.shutdown().await;
}

#[tokio::test]
async fn test_missing_recyclable_input_creates_nothing() {
    let harness = TestHarness::new();
    harness
        .enumerator
        .set(enumeration(&[("1.0", enumerated_workflow("ZMM"))]));
    let core = harness.core();

    let mut ticket = sample_ticket(&[1.0]);
    ticket.recycle_input_of = "DIGI".to_string();
    let ticket = core.create_ticket(ticket, TEST_USER).await.unwrap();
    let err = core
        .create_items_for_ticket(&ticket.prepid, TEST_USER)
        .await
        .unwrap_err();
    assert!(matches!(err, RelvalError::NotFound(_)));
    assert!(harness.items.is_empty());
    core.shutdown().await;
}
