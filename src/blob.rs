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

//! In-memory file contents plus their cached SHA-1 digest, as handed around
//! between the system file loader, the difference planner, and the image
//! planner.

use bytes::Bytes;

/// A path plus raw bytes plus a cached SHA-1 digest. Immutable once
/// constructed; cheap to clone since the backing bytes are reference
/// counted.
#[derive(Debug, Clone)]
pub struct FileBlob {
    path: String,
    data: Bytes,
    sha1_hex: String,
}

impl FileBlob {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        let sha1_hex = hex::encode(openssl::sha::sha1(&data));
        Self {
            path: path.into(),
            data: Bytes::from(data),
            sha1_hex,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn sha1_hex(&self) -> &str {
        &self.sha1_hex
    }
}

impl PartialEq for FileBlob {
    fn eq(&self, other: &Self) -> bool {
        self.sha1_hex == other.sha1_hex && self.data.len() == other.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_digest() {
        // sha1("abc") per RFC 3174's test vector.
        let blob = FileBlob::new("a", b"abc".to_vec());
        assert_eq!(blob.sha1_hex(), "a9993e364706816aba3e25717850c26c9cd0d89");
    }

    #[test]
    fn equal_bytes_produce_equal_blobs() {
        let a = FileBlob::new("a", b"same".to_vec());
        let b = FileBlob::new("b", b"same".to_vec());
        assert_eq!(a, b);
    }
}
