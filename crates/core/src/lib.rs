pub mod config;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod flows;

pub use chrono;
pub use domain::event::{EventData, EventId, EventResult, EventStatus, EventType, FlowEvent};
pub use domain::flow::{
    Flow, FlowConfig, FlowConfigPatch, FlowDraft, FlowId, FlowMetadata, FlowStatus, FlowUpdate,
    TenantId,
};
pub use domain::query::{
    FlowFilter, FlowPage, FlowQuery, FlowSortField, FlowStatistics, SortDirection, StatsFilter,
    StatusCount,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use executor::{
    ExecutorError, ExecutorErrorKind, ScriptedStageExecutor, SimulatedStageExecutor, StageAction,
    StageEffect, StageExecutor,
};
pub use flows::{BackoffPolicy, StageOutcome, StageRule};
