//! Synthetic load generator and correctness prober for distributed tracing
//! backends.
//!
//! The crate writes deterministically generated traces into a tracing backend
//! and later reconstructs the same traces from their seed to validate that
//! the backend returns them complete, unmodified, and findable via search.
//!
//! The key contract is the [`Seed`]: a timestamp rounded to the write
//! interval plus a tenant id. Everything about a trace (its id, span
//! structure, attributes, events, and long-write schedule) is a pure function
//! of its seed, so the write path and the validation path can run in
//! different processes and still agree on the expected trace.
//!
//! Four loops tick independently in soak mode:
//!
//! ```ascii
//!   +------------+     +-----------------+     +-------------------+
//!   | write loop +-----> TraceEmitter    +-----> SpanIngester      |
//!   +------------+     +-----------------+     +-------------------+
//!   +------------+     +-----------------+     +-------------------+
//!   | read loop  +-----> retrieval check +-----> TraceQuerier      |
//!   +------------+     +-----------------+     +-------------------+
//!   +------------+     +-----------------+     +-------------------+
//!   | search loop+-----> search check    +-----> TraceSearcher     |
//!   +------------+     +-----------------+     +-------------------+
//!   +------------+     +-----------------+     +-------------------+
//!   |tracked loop+-----> SpanTracker     +-----> ingester+searcher |
//!   +------------+     +-----------------+     +-------------------+
//! ```
//!
//! Outcomes are aggregated into [`metrics::ProbeMetrics`] by failure
//! category. A one-shot validation mode ([`validation::ValidationService`])
//! runs a fixed number of write/read/search cycles and reports via process
//! exit code instead.

pub mod checks;
pub mod client;
pub mod config;
pub mod emitter;
pub mod http;
pub mod in_memory;
pub mod metrics;
pub mod scheduler;
pub mod seed;
pub mod synthetic;
pub mod tracker;
pub mod validation;

pub use config::VultureConfig;
pub use scheduler::Vulture;
pub use seed::Seed;
