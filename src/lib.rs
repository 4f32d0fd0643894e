// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Trust pipeline for model-generated UI artifacts.
//!
//! Source goes through dependency resolution, security validation and
//! compilation before it is mounted in an isolated frame. Storage keeps an
//! append-only version history beside every artifact.

pub mod api;
pub mod auditor;
pub mod compiler;
pub mod config;
pub mod dependencies;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod jsx;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod pipeline;
pub mod sandbox;
pub mod source;
pub mod storage;
pub mod validator;
pub mod versions;
