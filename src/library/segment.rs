// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of content a segment covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    #[default]
    Ad,
    Intro,
    Outro,
    Content,
    Music,
    Unknown,
}

/// Review state of a detected segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    #[default]
    Predicted,
    Verified,
    Rejected,
}

/// A time range inside an episode, e.g. an ad break
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSegment {
    pub id: i64,
    pub episode_id: i64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub segment_type: SegmentType,
    pub status: SegmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AdSegment {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Input for recording a segment
#[derive(Debug, Clone)]
pub struct NewAdSegment {
    pub episode_id: i64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub segment_type: SegmentType,
    pub status: SegmentStatus,
    pub confidence: Option<f32>,
    pub notes: Option<String>,
}
