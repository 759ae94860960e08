// Copyright (c) 2026 The LUMEN developers. MIT License.
// See LICENSE for details.

//! # LUMEN Protocol — Core Library
//!
//! LUMEN is an instant-finality delegated-Proof-of-Stake layer that rides on
//! top of an ordinary longest-chain PoW blockchain. A fixed-size rotating
//! committee of operators commits individual "instant" transactions with
//! sub-block latency and finalizes one vice-block per height. Any honest
//! subset of at least `MIN_QUORUM` voters makes progress; a dishonest
//! minority can neither fork an instant commit nor split block finality.
//!
//! ## Architecture
//!
//! The hard engineering lives in one deterministic, side-effect-free state
//! machine per operator — the voter agent. Everything else is plumbing that
//! feeds it and carries its output:
//!
//! - **consensus::messages** — votes, vice-blocks, wire records, hashing.
//! - **consensus::state** — per-tip voting state (votes by round/subject/voter).
//! - **consensus::tally** — vote distributions, quorum and stalemate math.
//! - **consensus::voter** — the state machine itself. No I/O, no clocks,
//!   no threads; feed it messages, collect its output.
//! - **consensus::committee** — who is allowed to vote at a given tip.
//! - **consensus::controller** — the session layer: authentication, signing,
//!   persistence, relay, timeouts, garbage collection, block assembly.
//! - **crypto** — BLAKE3 hashing and Ed25519 operator keys.
//! - **storage** — sled-backed stores for votes, vice-blocks, and committee
//!   snapshots. Append-style writes; the controller replays them on startup.
//! - **config** — protocol constants. One place, no exceptions.
//!
//! ## Design Philosophy
//!
//! 1. The voter is a value type. If you can't unit-test it with a toy
//!    ledger in ten lines, the boundary is drawn in the wrong place.
//! 2. Determinism is a feature: identical inputs in identical order produce
//!    byte-identical outputs. Sorted maps everywhere order can leak out.
//! 3. Missing data is never an error — it's a fetch request. Misbehaving
//!    peers are never a panic — they're a structured error in the output.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod storage;
