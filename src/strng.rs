// Copyright Istio Authors
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

use arcstr::ArcStr;

/// Strng provides a string type optimized for cheap clones. Mesh, dataplane, backend and tag
/// names are cloned into every cache entry and log line, so they are all stored this way.
pub type Strng = ArcStr;

pub use arcstr::literal;

pub const EMPTY: Strng = literal!("");

pub fn new<A: AsRef<str>>(s: A) -> Strng {
    ArcStr::from(s.as_ref())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let a = new("kuma.io/service");
        let b = a.clone();
        assert!(ArcStr::ptr_eq(&a, &b));
        assert_eq!(format!("{a}"), "kuma.io/service");
        assert!(EMPTY.is_empty());
    }
}
