pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod errors;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod selection;
pub mod storage;
pub mod url_state;

pub use api::AnalyticsClient;
pub use cache::{Clock, ManualClock, PersistedCache, SystemClock};
pub use config::DashboardConfig;
pub use controller::{
    BoxFuture, ControllerBuilder, DashboardController, FetchRequest, Phase, ReferenceState,
};
pub use errors::{ConfigError, ErrorKind, FetchError, StorageError};
pub use models::{analysis_page_fields, Entity, FetchMode, FieldSpec, FieldValue};
pub use orchestrator::{FetchOrchestrator, KeySnapshot, RequestOptions, Settled};
pub use selection::{Selection, SelectionChange, SelectionStore};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use url_state::{Location, MemoryHistory, Params, UrlState, WriteMode};
