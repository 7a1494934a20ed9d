//! # Business Logic Services
//!
//! Domain logic behind the HTTP handlers and the match channel runtime.
//!
//! ## Available Services
//!
//! - **ELO** (`elo`) - Pure rating math for finalized duels
//! - **JWT** (`jwt`) - Access-token signing and validation
//! - **Matchmaking** (`matchmaking`) - Atomic find-or-join of waiting matches
//! - **Match logic** (`match_logic`) - Answer processing, completion, finalization
//! - **Task selector** (`task_selector`) - Per-difficulty random task assignment

pub mod elo;
pub mod jwt;
pub mod match_logic;
pub mod matchmaking;
pub mod task_selector;
