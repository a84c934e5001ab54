pub mod control;
pub mod event;
pub mod future;
pub mod handler;
pub mod ids;
pub mod journal;
pub mod session;
pub mod state;
pub mod task;
