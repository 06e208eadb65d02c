//! Client-side sync for a collaborative task board.
//!
//! The stores in [`session`], [`tasks`], [`presence`] and [`boards`] hold a
//! best-effort cache of backend rows. [`state::AppState`] wires them together
//! over one [`backend::Backend`].

pub mod backend;
pub mod boards;
pub mod clock;
pub mod config;
pub mod model;
pub mod presence;
pub mod session;
pub mod state;
pub mod tasks;
