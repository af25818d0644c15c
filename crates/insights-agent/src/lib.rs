// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster telemetry agent.
//!
//! Gatherers collect cluster state into [`record::Record`]s, the [`recorder::Recorder`]
//! anonymizes and buffers them, and [`archive`] writes them as gzipped tar archives that the
//! [`insights::uploader::Uploader`] ships upstream. The [`insights::report`] retriever pulls the
//! resulting health report back, [`ocm`] keeps entitlement certificates and pull-secret
//! transfers in sync, and [`status`] folds every subsystem summary into the conditions of the
//! cluster operator. [`datagather`] runs one-shot gatherings requested through the cluster.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod anonymization;
pub mod archive;
pub mod backoff;
pub mod cluster;
pub mod config;
pub mod controllerstatus;
pub mod datagather;
pub mod gather;
pub mod http;
pub mod insights;
pub mod metrics;
pub mod ocm;
pub mod periodic;
pub mod process;
pub mod receiver;
pub mod record;
pub mod recorder;
pub mod status;
