//! Purpose: Coordination core shared by the proxies of one network, plus the `gatehost` CLI.
//! Exports: `core` (errors), `storage` (blob stores), `kv` (buckets and watchers),
//! `messaging` (pub/sub transport), `rpc` (envelopes and event buses), `hosting`
//! (configuration, discovery, and the `Hosting` coordination object).
//! Role: Backend-agnostic library; each capability is a trait with swappable implementations.
//! Invariants: Consumers receive backends explicitly; there is no global state.
//! Invariants: Logging decorators never change results or error kinds.
pub mod core;
pub mod hosting;
pub mod kv;
pub mod messaging;
pub mod rpc;
pub mod storage;
