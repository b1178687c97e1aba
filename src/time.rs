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

use std::fmt::Debug;
use std::time::SystemTime;

/// Clock is the time source for certificate generation and rotation decisions.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(any(test, feature = "testing"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "testing"))]
mod mock {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use super::Clock;

    /// MockClock only moves when told to. Clones share the same time.
    #[derive(Clone, Debug)]
    pub struct MockClock {
        now: Arc<Mutex<SystemTime>>,
    }

    impl MockClock {
        pub fn new(now: SystemTime) -> Self {
            Self {
                now: Arc::new(Mutex::new(now)),
            }
        }

        pub fn set(&self, now: SystemTime) {
            *self.now.lock().unwrap() = now;
        }

        pub fn advance(&self, d: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += d;
        }
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::new(SystemTime::now())
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> SystemTime {
            *self.now.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::{Clock, MockClock};

    #[test]
    fn mock_clock_is_shared() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = MockClock::new(start);
        let other = clock.clone();
        other.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + Duration::from_secs(5));
        clock.set(start);
        assert_eq!(other.now(), start);
    }
}
