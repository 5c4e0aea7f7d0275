//! Session lifecycle engine: Active Session, Active Session
//! Manager, Session Store, Workspace Resolver, Session Controller.

pub mod active;
pub mod controller;
pub mod manager;
pub mod store;
pub mod workspace;

pub use active::{ActiveSession, ActiveStatus, CallerToolsConfig};
pub use controller::{
    EventsRequest, EventsResult, MessageRequest, MessageResult, NullRelayConnector,
    RelayConnector, SessionController, SpawnRequest, SpawnResult,
};
pub use manager::ActiveSessionManager;
pub use store::{NewSession, Session, SessionStatus, SessionStore, Turn};
pub use workspace::{ResolvedWorkspace, Workspace, WorkspaceRequest, WorkspaceStore};
