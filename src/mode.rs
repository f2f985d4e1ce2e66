// Copyright (c) 2020 kprotty
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, str::FromStr};
use thiserror::Error;

/// How a [`Condvar`](crate::Condvar) delivers wake ups. Fixed when the condvar is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WakeMode {
    /// "Wait morphing": the woken thread is handed ownership of the mutex it waited with while
    /// still asleep, so it never has to contend for the mutex after waking up.
    Handoff,
    /// The woken thread is made runnable and re-acquires its mutex like any other locker.
    Resume,
}

impl WakeMode {
    /// The mode used by [`Condvar::new`](crate::Condvar::new).
    ///
    /// `Handoff` when the `wait-morphing` feature is enabled (the default), `Resume` otherwise.
    #[cfg(feature = "wait-morphing")]
    pub const DEFAULT: Self = Self::Handoff;
    #[cfg(not(feature = "wait-morphing"))]
    pub const DEFAULT: Self = Self::Resume;
}

impl Default for WakeMode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for WakeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Handoff => "handoff",
            Self::Resume => "resume",
        })
    }
}

/// The error returned when parsing a [`WakeMode`] from an unrecognized string.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown wake mode {input:?} (expected \"handoff\" or \"resume\")")]
pub struct ParseWakeModeError {
    input: String,
}

impl ParseWakeModeError {
    /// The string that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

impl FromStr for WakeMode {
    type Err = ParseWakeModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "handoff" | "wait-morphing" | "morphing" => Ok(Self::Handoff),
            "resume" | "direct" | "plain" => Ok(Self::Resume),
            _ => Err(ParseWakeModeError {
                input: s.to_owned(),
            }),
        }
    }
}
