// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection recovery and retry with exponential backoff.

pub mod connection;
pub mod retry;

pub use connection::{ConnectionPhase, ConnectionRecoveryManager, ConnectionState};
pub use retry::{retry, RetryConfig};
