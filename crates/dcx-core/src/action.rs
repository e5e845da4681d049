//! Action planner: the pure state machine driving every subcommand
//!
//! Two tables, both pure functions of `(state, flags)` or `(command, state)` — no I/O, no
//! side effects, fully unit-testable without a daemon.

use crate::detector::ContainerState;

/// What the lifecycle executor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    None,
    Create,
    Start,
    Stop,
    Remove,
    Rebuild,
    Recreate,
    /// Stop then remove, tolerating a missing or already-stopped container.
    StopAndRemove,
    /// Best-effort stop: failures are swallowed by the executor (used for `BROKEN`).
    BestEffortStop,
    Exec,
    /// `exec`/`shell` against a `STALE` environment: proceeds but the CLI should warn.
    ExecWithWarning,
    /// The command is disallowed in this state.
    Error(&'static str),
}

/// Flags carried by `up`/`start` that steer the transition away from the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanFlags {
    pub rebuild: bool,
    pub recreate: bool,
}

/// Table from `(detected_state, rebuild_flag, recreate_flag)` to a [`PlanAction`].
/// `recreate` takes precedence over `rebuild` when both are set, matching the spec's
/// column ordering (recreate is the more drastic of the two).
pub fn plan_action(state: ContainerState, flags: PlanFlags) -> PlanAction {
    if flags.recreate {
        return match state {
            ContainerState::Absent => PlanAction::Create,
            _ => PlanAction::Recreate,
        };
    }
    if flags.rebuild {
        return match state {
            ContainerState::Absent => PlanAction::Create,
            _ => PlanAction::Rebuild,
        };
    }
    match state {
        ContainerState::Absent => PlanAction::Create,
        ContainerState::Created => PlanAction::Start,
        ContainerState::Running => PlanAction::None,
        ContainerState::Stopped => PlanAction::Start,
        ContainerState::Stale => PlanAction::Recreate,
        ContainerState::Broken => PlanAction::Recreate,
    }
}

/// The subcommands this engine exposes (mirrors the CLI's subcommand set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Up,
    Start,
    Stop,
    Down,
    Exec,
}

/// Offline-safe commands (`start`, `stop`, `down`, `exec`) never pull, build, or fetch;
/// only `up` is allowed to do that work. This table derives each command's action from the
/// detected state alone — flags don't apply to `start`/`stop`/`down`/`exec`.
pub fn plan_command(command: Command, state: ContainerState) -> PlanAction {
    use ContainerState::*;
    match (command, state) {
        (Command::Up, Absent) => PlanAction::Create,
        (Command::Up, Created | Stopped) => PlanAction::Start,
        (Command::Up, Running) => PlanAction::None,
        (Command::Up, Stale | Broken) => PlanAction::Recreate,

        (Command::Start, Absent) => PlanAction::Error("no environment exists; run `up` first"),
        (Command::Start, Created | Stopped) => PlanAction::Start,
        (Command::Start, Running) => PlanAction::None,
        (Command::Start, Stale) => PlanAction::Error("environment is stale; run `up` to recreate it"),
        (Command::Start, Broken) => PlanAction::Error("environment is broken; run `up` to recreate it"),

        (Command::Stop, Absent | Created | Stopped) => PlanAction::None,
        (Command::Stop, Running) => PlanAction::Stop,
        (Command::Stop, Stale) => PlanAction::Stop,
        (Command::Stop, Broken) => PlanAction::BestEffortStop,

        (Command::Down, Absent) => PlanAction::None,
        (Command::Down, Created | Stopped) => PlanAction::Remove,
        (Command::Down, Running) => PlanAction::StopAndRemove,
        (Command::Down, Stale) => PlanAction::StopAndRemove,
        (Command::Down, Broken) => PlanAction::StopAndRemove,

        (Command::Exec, Absent | Created | Stopped) => {
            PlanAction::Error("environment is not running; run `up` first")
        }
        (Command::Exec, Running) => PlanAction::Exec,
        (Command::Exec, Stale) => PlanAction::ExecWithWarning,
        (Command::Exec, Broken) => PlanAction::Error("environment is broken; run `up` to recreate it"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerState::*;

    #[test]
    fn test_plan_action_no_flags() {
        let none = PlanFlags::default();
        assert_eq!(plan_action(Absent, none), PlanAction::Create);
        assert_eq!(plan_action(Created, none), PlanAction::Start);
        assert_eq!(plan_action(Running, none), PlanAction::None);
        assert_eq!(plan_action(Stopped, none), PlanAction::Start);
        assert_eq!(plan_action(Stale, none), PlanAction::Recreate);
        assert_eq!(plan_action(Broken, none), PlanAction::Recreate);
    }

    #[test]
    fn test_plan_action_rebuild() {
        let rebuild = PlanFlags { rebuild: true, recreate: false };
        assert_eq!(plan_action(Absent, rebuild), PlanAction::Create);
        assert_eq!(plan_action(Created, rebuild), PlanAction::Rebuild);
        assert_eq!(plan_action(Running, rebuild), PlanAction::Rebuild);
        assert_eq!(plan_action(Stale, rebuild), PlanAction::Rebuild);
    }

    #[test]
    fn test_plan_action_recreate_wins_over_rebuild() {
        let both = PlanFlags { rebuild: true, recreate: true };
        assert_eq!(plan_action(Running, both), PlanAction::Recreate);
    }

    #[test]
    fn test_plan_command_up() {
        assert_eq!(plan_command(Command::Up, Absent), PlanAction::Create);
        assert_eq!(plan_command(Command::Up, Running), PlanAction::None);
        assert_eq!(plan_command(Command::Up, Stale), PlanAction::Recreate);
    }

    #[test]
    fn test_plan_command_start_errors_when_absent_or_stale() {
        assert!(matches!(plan_command(Command::Start, Absent), PlanAction::Error(_)));
        assert!(matches!(plan_command(Command::Start, Stale), PlanAction::Error(_)));
        assert_eq!(plan_command(Command::Start, Stopped), PlanAction::Start);
    }

    #[test]
    fn test_plan_command_stop_is_best_effort_when_broken() {
        assert_eq!(plan_command(Command::Stop, Broken), PlanAction::BestEffortStop);
        assert_eq!(plan_command(Command::Stop, Absent), PlanAction::None);
    }

    #[test]
    fn test_plan_command_down_removes_or_stops_and_removes() {
        assert_eq!(plan_command(Command::Down, Created), PlanAction::Remove);
        assert_eq!(plan_command(Command::Down, Running), PlanAction::StopAndRemove);
        assert_eq!(plan_command(Command::Down, Absent), PlanAction::None);
    }

    #[test]
    fn test_plan_command_exec_warns_on_stale_and_errors_otherwise() {
        assert_eq!(plan_command(Command::Exec, Running), PlanAction::Exec);
        assert_eq!(plan_command(Command::Exec, Stale), PlanAction::ExecWithWarning);
        assert!(matches!(plan_command(Command::Exec, Broken), PlanAction::Error(_)));
        assert!(matches!(plan_command(Command::Exec, Absent), PlanAction::Error(_)));
    }
}
