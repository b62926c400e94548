// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gateway WebSocket RPC client: protocol frames and the connection itself.

pub mod client;
pub mod protocol;

pub use client::{ClientState, EventSubscription, RpcClient, RpcClientOptions};
