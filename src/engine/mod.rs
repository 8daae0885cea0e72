//! Rule-evaluation engine.
//!
//! The engine is the cluster-independent core of the operator: a
//! thread-safe store of compiled rules, the matcher, the patch synthesizer
//! and the per-request pipeline. Kubernetes enters only through the
//! [`ResourceFetcher`] capability and the admission server that drives
//! [`AdmissionEngine::evaluate`].

pub mod apply;
pub mod compiled;
pub mod fetcher;
pub mod pipeline;
pub mod store;

pub use apply::{PatchError, PatchOptions};
pub use compiled::{CompiledModRule, RuleCompileError, SynthesisError};
pub use fetcher::KubeResourceFetcher;
pub use pipeline::{
    AdmissionDecision, AdmissionEngine, FetchError, ResourceFetcher, LAST_APPLIED_ANNOTATION,
    NODENAME_ANNOTATION,
};
pub use store::{ModRuleStore, StoreError};
