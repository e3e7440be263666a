//! shuttle-services — the transfer engine: content store, server-side
//! workers and registry, and the client-side receiver.

pub mod error;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod tokenizable;
pub mod worker;

pub use error::SessionError;
pub use receiver::{Receiver, ReceiverSettings, ReceiverState, TransferReport};
pub use registry::{Reaper, Registry};
pub use server::serve;
pub use session::{SessionOutcome, SessionReport};
pub use store::{ContentStore, FsStore, StoreError};
pub use tokenizable::{Applied, TokenizableFile};
pub use worker::{Worker, WorkerSettings, WorkerState};
