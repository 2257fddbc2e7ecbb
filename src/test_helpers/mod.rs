// Test Helpers Module - Integration Testing Infrastructure
//
// Collaborator fakes and a harness that builds a complete orchestration core on
// top of them, shared by unit tests, integration tests and benchmarks.

pub mod fakes;
pub mod shared_test_setup;

pub use fakes::{
    job_field_values, FakeCatalog, FakeEnumerator, FakeTracker, FaultyDocumentStore,
    RecordingBatchService, RecordingNotifier, ScriptedExecutor, ScriptedSession, SentMessage,
};

pub use shared_test_setup::{
    digi_step, enumerated_workflow, enumeration, gen_sim_step, sample_item, sample_ticket,
    store_item, test_config, wait_until, TestHarness, TEST_ALIAS, TEST_BATCH, TEST_GLOBALTAG,
    TEST_RELEASE, TEST_SCRAM_ARCH, TEST_USER,
};
