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

use super::{Monitor, Notify, Turn};

macro_rules! morphsync_monitor {
    ($name:ident, $label:expr, $mode:expr) => {
        pub struct $name {
            turn: morphsync::Mutex<Turn>,
            cond: morphsync::Condvar,
        }

        impl Monitor for $name {
            const NAME: &'static str = $label;

            fn new(threads: usize) -> Self {
                Self {
                    turn: morphsync::Mutex::new(Turn::new(threads)),
                    cond: morphsync::Condvar::with_mode($mode),
                }
            }

            fn take_turn(&self, id: usize, notify: Notify) -> bool {
                let mut turn = self.turn.lock();
                self.cond.wait_while(&mut turn, |turn| !turn.ready(id));
                let running = turn.advance();
                drop(turn);

                match notify {
                    Notify::One => self.cond.notify_one(),
                    Notify::All => self.cond.notify_all(),
                };
                running
            }

            fn stop(&self) {
                self.turn.lock().stopped = true;
                self.cond.notify_all();
            }
        }
    };
}

morphsync_monitor!(HandoffMonitor, "morphsync(handoff)", morphsync::WakeMode::Handoff);
morphsync_monitor!(ResumeMonitor, "morphsync(resume)", morphsync::WakeMode::Resume);

pub struct ParkingLotMonitor {
    turn: parking_lot::Mutex<Turn>,
    cond: parking_lot::Condvar,
}

impl Monitor for ParkingLotMonitor {
    const NAME: &'static str = "parking_lot";

    fn new(threads: usize) -> Self {
        Self {
            turn: parking_lot::Mutex::new(Turn::new(threads)),
            cond: parking_lot::Condvar::new(),
        }
    }

    fn take_turn(&self, id: usize, notify: Notify) -> bool {
        let mut turn = self.turn.lock();
        while !turn.ready(id) {
            self.cond.wait(&mut turn);
        }
        let running = turn.advance();
        drop(turn);

        match notify {
            Notify::One => self.cond.notify_one(),
            Notify::All => self.cond.notify_all() > 0,
        };
        running
    }

    fn stop(&self) {
        self.turn.lock().stopped = true;
        self.cond.notify_all();
    }
}

pub struct StdMonitor {
    turn: std::sync::Mutex<Turn>,
    cond: std::sync::Condvar,
}

impl Monitor for StdMonitor {
    const NAME: &'static str = "std";

    fn new(threads: usize) -> Self {
        Self {
            turn: std::sync::Mutex::new(Turn::new(threads)),
            cond: std::sync::Condvar::new(),
        }
    }

    fn take_turn(&self, id: usize, notify: Notify) -> bool {
        let turn = self.turn.lock().unwrap();
        let mut turn = self.cond.wait_while(turn, |turn| !turn.ready(id)).unwrap();
        let running = turn.advance();
        drop(turn);

        match notify {
            Notify::One => self.cond.notify_one(),
            Notify::All => self.cond.notify_all(),
        }
        running
    }

    fn stop(&self) {
        self.turn.lock().unwrap().stopped = true;
        self.cond.notify_all();
    }
}
