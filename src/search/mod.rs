pub mod lifecycle;


pub use lifecycle::{
    AiJobSearch, ClampSource, LifecycleError, ProgressOutcome, ReasoningEntry, SearchEvent,
    SearchLifecycle, SearchPhase, SearchState, WeekRef,
};
