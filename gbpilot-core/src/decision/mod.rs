//! # Decision Engine
//!
//! | Module     | Role                                               |
//! |------------|----------------------------------------------------|
//! | `oracle`   | `DecisionOracle` seam, request/response, process oracle |
//! | `retry`    | error classification, backoff policy, retry state  |
//! | `engine`   | the call/classify/backoff loop                     |
//! | `fallback` | low-risk actions after repeated failures           |
//! | `timing`   | settle wait and recording window formulas          |

pub mod engine;
pub mod fallback;
pub mod oracle;
pub mod retry;
pub mod timing;

pub use engine::{DecisionEngine, DecisionOutcome, EnginePhase, RECENT_ACTIONS_CAPACITY};
pub use fallback::{FallbackChoice, FallbackConfig, FallbackPolicy, FallbackReason};
pub use oracle::{
    tool_schema, DecisionOracle, ImageFormat, OracleImage, OracleRequest, OracleResponse, ProcessOracle,
    ProcessOracleConfig,
};
pub use retry::{classify_error, is_image_rejection, ErrorClass, RetryPolicy, RetryState};
pub use timing::{frames_to_duration, TimingConfig, TimingModel};
