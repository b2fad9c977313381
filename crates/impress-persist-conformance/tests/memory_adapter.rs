//! The memory adapter against the shared conformance suite.

use std::sync::{Arc, Once};

use impress_persist::{create_memory_db, memory_adapter, MemoryDb, RawAdapter};
use impress_persist_conformance::run_adapter_tests;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn fresh_adapter() -> Arc<dyn RawAdapter> {
    Arc::new(memory_adapter(create_memory_db()))
}

fn no_reset() {}

// One test per case, each on its own store.
mod per_case {
    use super::*;

    impress_persist_conformance::adapter_conformance!("memory", fresh_adapter, no_reset);
}

/// The whole battery in sequence on one shared store, relying on `reset`.
#[tokio::test]
async fn shared_store_passes_full_suite() {
    init_tracing();
    let db: Arc<MemoryDb> = create_memory_db();
    let create = {
        let db = Arc::clone(&db);
        move || -> Arc<dyn RawAdapter> { Arc::new(memory_adapter(Arc::clone(&db))) }
    };
    run_adapter_tests("memory (shared)", create, || db.reset()).await;
}
