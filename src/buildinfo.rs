// Copyright 2024 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pulls the handful of `build.prop` fields the composer needs for device
//! asserts and the metadata manifest out of an archive's parsed key/value
//! dictionary.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::OtaError;

#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    pub device_models: Vec<String>,
    pub compatible_product: String,
    pub timestamp: Option<u64>,
    pub fingerprint: String,
    pub build_id: String,
}

impl BuildInfo {
    pub fn from_build_prop(props: &BTreeMap<String, String>) -> Result<Self> {
        let device = props.get("ro.product.device").cloned().unwrap_or_default();
        let device_models = device
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let timestamp = match props.get("ro.build.date.utc") {
            Some(v) => Some(v.trim().parse::<u64>().map_err(|_| {
                OtaError::InputMalformed(format!("unparseable ro.build.date.utc: {v:?}"))
            })?),
            None => None,
        };
        Ok(Self {
            device_models,
            compatible_product: props.get("ro.build.product").cloned().unwrap_or_default(),
            timestamp,
            fingerprint: props.get("ro.build.fingerprint").cloned().unwrap_or_default(),
            build_id: props.get("ro.build.id").cloned().unwrap_or_default(),
        })
    }

    /// `fromgb` (spec.md §4.6): whether the source build predates the
    /// transition away from the legacy first-boot image layout.
    pub fn is_gingerbread(&self) -> bool {
        self.build_id == "GINGERBREAD"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_fields() {
        let mut props = BTreeMap::new();
        props.insert("ro.product.device".to_string(), "walleye".to_string());
        props.insert("ro.build.fingerprint".to_string(), "brand/product/device:10/ID/1:user/release-keys".to_string());
        props.insert("ro.build.id".to_string(), "QQ1A.200105.002".to_string());
        props.insert("ro.build.date.utc".to_string(), "1577836800".to_string());
        let info = BuildInfo::from_build_prop(&props).unwrap();
        assert_eq!(info.device_models, vec!["walleye".to_string()]);
        assert_eq!(info.timestamp, Some(1577836800));
        assert!(!info.is_gingerbread());
    }

    #[test]
    fn unparseable_timestamp_is_input_malformed() {
        let mut props = BTreeMap::new();
        props.insert("ro.build.date.utc".to_string(), "not-a-number".to_string());
        let result = BuildInfo::from_build_prop(&props);
        assert!(result
            .unwrap_err()
            .downcast_ref::<OtaError>()
            .map(|e| matches!(e, OtaError::InputMalformed(_)))
            .unwrap_or(false));
    }
}
