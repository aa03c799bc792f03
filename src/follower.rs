// Line-following decision logic
//
// One call to `cycle` per control period: look at the enable input and the
// fresh line state, pick a motion, issue it. Marker maneuvers and the
// end-zone recovery are timed, blocking sequences that finish inside the
// cycle that started them and are reported through its `Decision`; a
// released enable input takes effect on the next cycle after them.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{EndZoneConfig, FollowerConfig};
use crate::hal::SharedClock;
use crate::motor::{DriveCommand, Drivetrain};
use crate::sensor::LineState;

/// Longest sleep inside a timed maneuver between ramp ticks
const HOLD_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    /// Motors stopped, waiting for the enable input
    Idle,
    Following,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerTurn {
    QuarterLeft,
    QuarterRight,
    Half,
}

/// What a cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Idle,
    /// Line source gave nothing usable this cycle
    NoData,
    Straight,
    CorrectLeft,
    CorrectRight,
    /// Neither sensor on the line, creeping forward
    Searching,
    /// A scripted marker turn ran to completion this cycle
    Marker(MarkerTurn),
    /// The end-zone recovery ran to completion this cycle
    EndZone,
}

/// Measures how long both sensors have been off the line.
///
/// Fires once per continuous off-line run: after `consume` it stays idle
/// until a sensor reports the line again.
#[derive(Debug, Default)]
pub struct EndZoneTimer {
    started: Option<Instant>,
    spent: bool,
}

impl EndZoneTimer {
    /// Both sensors off-line at `now`; returns the accumulated duration
    pub fn observe_off_line(&mut self, now: Instant) -> Option<Duration> {
        if self.spent {
            return None;
        }
        let started = *self.started.get_or_insert(now);
        Some(now.saturating_duration_since(started))
    }

    /// A sensor saw the line
    pub fn reset(&mut self) {
        self.started = None;
        self.spent = false;
    }

    /// The recovery ran; stay quiet for the rest of this off-line run
    pub fn consume(&mut self) {
        self.started = None;
        self.spent = true;
    }

    pub fn started(&self) -> Option<Instant> {
        self.started
    }
}

pub struct LineFollower<D: Drivetrain> {
    config: FollowerConfig,
    drive: D,
    clock: SharedClock,
    state: FollowState,
    end_zone: EndZoneTimer,
    // Marker maneuvers trigger on the marker's rising edge only
    marker_armed: bool,
}

impl<D: Drivetrain> LineFollower<D> {
    pub fn new(config: FollowerConfig, drive: D, clock: SharedClock) -> Self {
        Self {
            config,
            drive,
            clock,
            state: FollowState::Idle,
            end_zone: EndZoneTimer::default(),
            marker_armed: true,
        }
    }

    pub fn state(&self) -> FollowState {
        self.state
    }

    pub fn end_zone(&self) -> &EndZoneTimer {
        &self.end_zone
    }

    pub fn drive(&self) -> &D {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut D {
        &mut self.drive
    }

    /// Run one control cycle
    pub fn cycle(&mut self, enabled: bool, line: Option<LineState>) -> Decision {
        if !enabled {
            if self.state != FollowState::Idle {
                info!("Enable released, stopping");
                self.drive.stop_immediate();
                self.end_zone.reset();
                self.state = FollowState::Idle;
            }
            return Decision::Idle;
        }

        if self.state == FollowState::Idle {
            info!("Enabled, following line");
            self.state = FollowState::Following;
        }

        let decision = match line {
            Some(line) => self.follow(line),
            None => Decision::NoData,
        };
        self.drive.tick();
        debug!("{:?} -> {:?}", line, decision);
        decision
    }

    /// Stop the wheels and go back to idle
    pub fn stop(&mut self) {
        self.drive.stop_immediate();
        self.state = FollowState::Idle;
    }

    fn follow(&mut self, line: LineState) -> Decision {
        let now = self.clock.now();
        if !line.marker {
            self.marker_armed = true;
        }
        if line.left || line.right {
            self.end_zone.reset();
        }

        if self.config.marker_enabled && line.marker && self.marker_armed {
            let turn = match (line.left, line.right) {
                (true, true) => Some(MarkerTurn::Half),
                (true, false) => Some(MarkerTurn::QuarterLeft),
                (false, true) => Some(MarkerTurn::QuarterRight),
                (false, false) => None,
            };
            if let Some(turn) = turn {
                self.marker_armed = false;
                self.marker_action(turn);
                return Decision::Marker(turn);
            }
        }

        let base = self.config.base_speed;
        let turn = self.config.turn_speed;
        match (line.left, line.right) {
            (true, true) => {
                self.drive.command(DriveCommand::Forward(base));
                Decision::Straight
            }
            (true, false) => {
                self.drive.command(DriveCommand::TurnLeft(turn));
                self.hold(self.config.correction_pulse);
                self.drive.command(DriveCommand::Forward(base));
                Decision::CorrectLeft
            }
            (false, true) => {
                self.drive.command(DriveCommand::TurnRight(turn));
                self.hold(self.config.correction_pulse);
                self.drive.command(DriveCommand::Forward(base));
                Decision::CorrectRight
            }
            (false, false) => {
                if let Some(end_zone) = self.config.end_zone {
                    let lost_for = self.end_zone.observe_off_line(now);
                    if lost_for.is_some_and(|d| d >= end_zone.threshold) {
                        self.end_zone_action(end_zone);
                        return Decision::EndZone;
                    }
                }
                self.drive.command(DriveCommand::Forward(self.config.search_speed));
                Decision::Searching
            }
        }
    }

    fn marker_action(&mut self, turn: MarkerTurn) {
        info!("Marker: {:?}", turn);

        let speed = self.config.turn_speed;
        let (command, duration) = match turn {
            MarkerTurn::QuarterLeft => (DriveCommand::TurnLeft(speed), self.config.quarter_turn),
            MarkerTurn::QuarterRight => (DriveCommand::TurnRight(speed), self.config.quarter_turn),
            MarkerTurn::Half => (DriveCommand::TurnRight(speed), self.config.half_turn),
        };
        self.drive.command(command);
        self.hold(duration);
        self.drive.command(DriveCommand::Forward(self.config.base_speed));
    }

    fn end_zone_action(&mut self, end_zone: EndZoneConfig) {
        info!("No line for {:?}, running end zone turn", end_zone.threshold);

        self.drive.stop_immediate();
        self.clock.sleep(end_zone.pause);
        self.drive.command(DriveCommand::TurnRight(self.config.turn_speed));
        self.hold(end_zone.turn);
        self.drive.stop_immediate();

        self.end_zone.consume();
    }

    /// Keep the current command running for `duration`, ticking the ramp
    fn hold(&mut self, duration: Duration) {
        let start = self.clock.now();
        loop {
            let changed = self.drive.tick();
            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= duration {
                break;
            }
            if !changed {
                self.clock.sleep((duration - elapsed).min(HOLD_POLL));
            }
        }
    }
}
