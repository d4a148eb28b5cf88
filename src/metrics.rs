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

use std::time::Instant;

use prometheus_client::registry::Registry;

/// Creates a metrics sub registry for Istio.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
    registry.sub_registry_with_prefix("istio")
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

/// Timer records the time elapsed between its creation and when it is dropped, reporting
/// it to the recorder as event `E`.
#[must_use = "metric will be dropped (and thus recorded) immediately if not assigned"]
pub struct Timer<'a, E, R>
where
    R: Recorder<E, std::time::Duration>,
{
    recorder: &'a R,
    event: E,
    start: Instant,
}

impl<'a, E, R> Timer<'a, E, R>
where
    R: Recorder<E, std::time::Duration>,
{
    pub fn new(recorder: &'a R, event: E) -> Self {
        Self {
            recorder,
            event,
            start: Instant::now(),
        }
    }
}

impl<E, R> Drop for Timer<'_, E, R>
where
    R: Recorder<E, std::time::Duration>,
{
    fn drop(&mut self) {
        self.recorder.record(&self.event, self.start.elapsed());
    }
}
