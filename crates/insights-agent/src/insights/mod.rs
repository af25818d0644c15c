// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upload of archives and retrieval of their analysis.

pub mod client;
pub mod processing;
pub mod report;
pub mod uploader;

pub use client::{HttpError, InsightsClient, InsightsError, Outcome, Source, UploadResponse};
