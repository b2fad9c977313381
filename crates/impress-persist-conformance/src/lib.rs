//! Impress Persist Conformance - the behavioural contract every backend must meet
//!
//! Cases cover CRUD round trips, constraint enforcement, predicate operators
//! and combinators, sort determinism, required and optional joins, change
//! delivery, idempotent deletes, and a mixed operation sequence compared
//! against the memory adapter.
//!
//! Run the whole battery from one test:
//!
//! ```ignore
//! #[tokio::test]
//! async fn memory_backend_conforms() {
//!     let db = impress_persist::create_memory_db();
//!     impress_persist_conformance::run_adapter_tests(
//!         "memory",
//!         || Arc::new(impress_persist::memory_adapter(Arc::clone(&db))) as _,
//!         || db.reset(),
//!     )
//!     .await;
//! }
//! ```
//!
//! or register each case as its own `#[tokio::test]` with
//! [`adapter_conformance!`] (the calling crate needs `tokio` as a
//! dev-dependency).

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use impress_persist::RawAdapter;

pub mod cases;
pub mod fixture;

pub use fixture::{fixture_schema, Fixture};

/// Reset the backend, open a fresh fixture on it and run one case. A failing
/// case panics with the adapter and case names attached.
pub async fn run_case<C, R, F, Fut>(
    adapter: &str,
    case: &str,
    create_adapter: &C,
    reset: &R,
    body: F,
) where
    C: Fn() -> Arc<dyn RawAdapter>,
    R: Fn(),
    F: FnOnce(Fixture) -> Fut,
    Fut: Future<Output = ()>,
{
    reset();
    let fixture = match Fixture::open(create_adapter()).await {
        Ok(fixture) => fixture,
        Err(err) => panic!("[{adapter}] {case}: could not open adapter: {err}"),
    };
    tracing::info!(adapter, case, "running conformance case");
    if let Err(payload) = AssertUnwindSafe(body(fixture)).catch_unwind().await {
        panic!("[{adapter}] {case} failed: {}", panic_message(&*payload));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Run every conformance case in sequence against one backend.
///
/// `create_adapter` is called once per case, after `reset`.
pub async fn run_adapter_tests<C, R>(name: &str, create_adapter: C, reset: R)
where
    C: Fn() -> Arc<dyn RawAdapter>,
    R: Fn(),
{
    tracing::info!(adapter = name, "starting conformance suite");
    crate::__conformance_cases!(run(name, create_adapter, reset));
}

/// Generate one `#[tokio::test]` per conformance case.
///
/// Invoke once per module: the generated functions are named after the cases.
///
/// ```ignore
/// mod memory {
///     use std::sync::Arc;
///     impress_persist_conformance::adapter_conformance!(
///         "memory",
///         || Arc::new(impress_persist::memory_adapter(impress_persist::create_memory_db())) as _,
///         || {}
///     );
/// }
/// ```
#[macro_export]
macro_rules! adapter_conformance {
    ($name:expr, $create:expr, $reset:expr $(,)?) => {
        $crate::__conformance_cases!(tests($name, $create, $reset));
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __conformance_cases {
    ($mode:ident $args:tt) => {
        $crate::__conformance_cases!(@emit $mode $args [
            insert_and_find_round_trip,
            users_scenario,
            insert_fills_defaults,
            duplicate_primary_key_rejected,
            unique_violation_rejected,
            foreign_key_violation_rejected,
            primary_key_is_immutable,
            failed_mutations_leave_state_unchanged,
            comparison_operators,
            timestamp_ordering,
            predicate_combinators,
            sort_is_deterministic,
            pagination,
            required_join,
            optional_join,
            subscription_delivers_each_change_once_in_order,
            subscription_payloads,
            subscription_filter_and_unsubscribe,
            panicking_subscriber_is_isolated,
            subscriber_reads_post_mutation_state,
            delete_is_idempotent,
            batch_insert_is_atomic,
            mixed_sequence_matches_memory,
        ]);
    };
    (@emit tests ($name:expr, $create:expr, $reset:expr) [$($case:ident),+ $(,)?]) => {
        $(
            #[tokio::test]
            async fn $case() {
                $crate::run_case(
                    $name,
                    stringify!($case),
                    &$create,
                    &$reset,
                    $crate::cases::$case,
                )
                .await;
            }
        )+
    };
    (@emit run ($name:expr, $create:expr, $reset:expr) [$($case:ident),+ $(,)?]) => {
        $(
            $crate::run_case(
                $name,
                stringify!($case),
                &$create,
                &$reset,
                $crate::cases::$case,
            )
            .await;
        )+
    };
}
