// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Loading [`NpmCache`] snapshots.

use npm_api::NpmCache;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Where a running NPM serves its cache.
pub const DEFAULT_CACHE_URL: &str =
    "http://localhost:10091/npm/v1/debug/manager";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to request NPM cache from {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("NPM cache request to {url} returned {status}")]
    Status { url: String, status: reqwest::StatusCode },

    #[error("cannot decode NPM cache: {0}")]
    Decode(#[from] serde_json::Error),
}

pub fn from_reader<R: Read>(reader: R) -> Result<NpmCache, CacheError> {
    Ok(serde_json::from_reader(BufReader::new(reader))?)
}

pub fn from_file<P: AsRef<Path>>(path: P) -> Result<NpmCache, CacheError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| CacheError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    from_reader(file)
}

/// Fetch the cache from a running NPM instance.
pub fn from_url(url: &str) -> Result<NpmCache, CacheError> {
    let request_err =
        |source| CacheError::Request { url: url.to_string(), source };

    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(request_err)?;

    let resp = client.get(url).send().map_err(request_err)?;
    if !resp.status().is_success() {
        return Err(CacheError::Status {
            url: url.to_string(),
            status: resp.status(),
        });
    }

    resp.json::<NpmCache>().map_err(request_err)
}
