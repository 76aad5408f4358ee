//! Waypoint programs: a line-oriented format executed against the cell.
//!
//! ```text
//! # pick and place
//! move robot 300 0 200
//! write io gripper true
//! wait 250
//! read io part_present present
//! print picked $present
//! ```
//!
//! One statement per line, blank lines and `#` comments are ignored. Words
//! of a `print` starting with `$` are replaced by the stored variable.

use std::time::Duration;

use async_trait::async_trait;

use cellrun_adapter_virtual::VirtualRobot;
use cellrun_app::runner::{ExecutionContext, ProgramExecutor};
use cellrun_domain::error::{CellError, Location, ProgramError};
use cellrun_domain::motion::Pose;
use cellrun_domain::program::ProgramKind;
use cellrun_domain::value::Value;

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Move { robot: String, target: Pose },
    Write { device: String, key: String, value: Value },
    Read { device: String, key: String, variable: Option<String> },
    Wait(Duration),
    Print(String),
}

/// A statement and the line it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub number: u32,
    pub statement: Statement,
}

/// Parse a whole program.
///
/// # Errors
///
/// Returns a [`ProgramError`] located at the offending token.
pub fn parse(source: &str) -> Result<Vec<Line>, ProgramError> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = u32::try_from(index + 1).unwrap_or(u32::MAX);
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let statement = parse_statement(number, text)?;
        lines.push(Line { number, statement });
    }
    Ok(lines)
}

struct Token<'a> {
    column: u32,
    offset: usize,
    text: &'a str,
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (offset, ch) in text.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(begin)) => {
                tokens.push(token(text, begin, offset));
                start = None;
            }
            (false, None) => start = Some(offset),
            _ => {}
        }
    }
    if let Some(begin) = start {
        tokens.push(token(text, begin, text.len()));
    }
    tokens
}

fn token(text: &str, begin: usize, end: usize) -> Token<'_> {
    let column = u32::try_from(text[..begin].chars().count() + 1).unwrap_or(u32::MAX);
    Token {
        column,
        offset: begin,
        text: &text[begin..end],
    }
}

fn parse_statement(number: u32, text: &str) -> Result<Statement, ProgramError> {
    let tokens = tokenize(text);
    let error = |column: u32, message: String| {
        ProgramError::new(message).at(Location::point(number, column))
    };
    let Some(command) = tokens.first() else {
        return Err(error(1, "empty statement".to_string()));
    };
    let arguments = &tokens[1..];
    let expect = |count: usize, usage: &str| {
        if arguments.len() == count {
            Ok(())
        } else {
            Err(error(
                command.column,
                format!("`{}` expects {usage}", command.text),
            ))
        }
    };

    match command.text {
        "move" => {
            expect(4, "<robot> <x> <y> <z>")?;
            let x = number_at(number, &arguments[1])?;
            let y = number_at(number, &arguments[2])?;
            let z = number_at(number, &arguments[3])?;
            Ok(Statement::Move {
                robot: arguments[0].text.to_string(),
                target: Pose::new(x, y, z),
            })
        }
        "write" => {
            expect(3, "<device> <key> <value>")?;
            let Ok(value) = arguments[2].text.parse::<Value>();
            Ok(Statement::Write {
                device: arguments[0].text.to_string(),
                key: arguments[1].text.to_string(),
                value,
            })
        }
        "read" => {
            if !(2..=3).contains(&arguments.len()) {
                return Err(error(
                    command.column,
                    "`read` expects <device> <key> [variable]".to_string(),
                ));
            }
            Ok(Statement::Read {
                device: arguments[0].text.to_string(),
                key: arguments[1].text.to_string(),
                variable: arguments.get(2).map(|token| token.text.to_string()),
            })
        }
        "wait" => {
            expect(1, "<milliseconds>")?;
            let millis: u64 = arguments[0].text.parse().map_err(|_| {
                error(
                    arguments[0].column,
                    format!("expected milliseconds, found `{}`", arguments[0].text),
                )
            })?;
            Ok(Statement::Wait(Duration::from_millis(millis)))
        }
        "print" => {
            let rest = arguments
                .first()
                .map_or("", |first| text[first.offset..].trim_end());
            Ok(Statement::Print(rest.to_string()))
        }
        other => Err(error(
            command.column,
            format!("unknown statement `{other}`"),
        )),
    }
}

fn number_at(line: u32, token: &Token<'_>) -> Result<f64, ProgramError> {
    token
        .text
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| {
            ProgramError::new(format!("expected a number, found `{}`", token.text))
                .at(Location::point(line, token.column))
        })
}

/// Executes [`ProgramKind::Waypoints`] programs.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaypointExecutor;

#[async_trait]
impl ProgramExecutor for WaypointExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), CellError> {
        let program = ctx.program();
        if program.kind != ProgramKind::Waypoints {
            return Err(ProgramError::new(format!("cannot execute {} programs", program.kind)).into());
        }
        let lines = parse(&program.content)?;
        ctx.log(format!("executing {} statements", lines.len()));

        for line in &lines {
            ctx.check_stop()?;
            tracing::debug!(line = line.number, statement = ?line.statement, "executing");
            execute(ctx, &line.statement)
                .await
                .map_err(|err| locate(err, line.number))?;
        }
        Ok(())
    }
}

async fn execute(ctx: &ExecutionContext, statement: &Statement) -> Result<(), CellError> {
    let cell = ctx.cell();
    match statement {
        Statement::Move { robot, target } => {
            cell.device::<VirtualRobot>(robot)?.move_to(*target).await
        }
        Statement::Write { device, key, value } => {
            cell.writable(device)?.write(key, value.clone()).await
        }
        Statement::Read {
            device,
            key,
            variable,
        } => {
            let value = cell.readable(device)?.read(key).await?;
            match variable {
                Some(variable) => ctx.set(variable.clone(), value),
                None => ctx.println(format!("{device}.{key} = {value}")),
            }
            Ok(())
        }
        Statement::Wait(duration) => cell.timer()?.wait(*duration).await,
        Statement::Print(text) => {
            ctx.println(substitute(ctx, text));
            Ok(())
        }
    }
}

fn substitute(ctx: &ExecutionContext, text: &str) -> String {
    text.split(' ')
        .map(|word| match word.strip_prefix('$').and_then(|name| ctx.get(name)) {
            Some(serde_json::Value::String(value)) => value,
            Some(value) => value.to_string(),
            None => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Attach the statement's line to program errors that carry no location.
fn locate(err: CellError, line: u32) -> CellError {
    match err {
        CellError::Program(program) if program.location().is_none() => {
            program.at(Location::point(line, 1)).into()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_app::cell::Cell;
    use cellrun_app::registry::DeviceRegistry;
    use cellrun_app::runner::{ProgramRunner, run_program};
    use cellrun_domain::configuration::DeviceConfiguration;
    use cellrun_domain::program::Program;
    use cellrun_domain::run::ProgramRunState;

    fn cell() -> Cell {
        let mut registry = DeviceRegistry::new();
        cellrun_adapter_virtual::register(&mut registry).unwrap();
        let mut robot = DeviceConfiguration::new("virtual_robot", "robot");
        robot
            .settings
            .insert("tcp_speed".to_string(), serde_json::json!(10_000.0));
        let mut io = DeviceConfiguration::new("virtual_io", "io");
        io.settings
            .insert("inputs".to_string(), serde_json::json!({"part_present": true}));
        io.settings
            .insert("ack_delay_ms".to_string(), serde_json::json!(1));
        Cell::from_configurations(&registry, vec![robot, io]).unwrap()
    }

    fn location(err: &ProgramError) -> (u32, u32) {
        let position = err.location().unwrap().start();
        (position.line, position.column)
    }

    // ── Parsing ────────────────────────────────────────────────────

    #[test]
    fn should_parse_every_statement() {
        let source = "
            # demo
            move robot 300 -20.5 200
            write io gripper true
            read io part_present present
            read robot pose.x
            wait 250
            print picked $present
        ";
        let lines = parse(source).unwrap();
        let statements: Vec<_> = lines.iter().map(|line| line.statement.clone()).collect();
        assert_eq!(
            statements,
            vec![
                Statement::Move {
                    robot: "robot".to_string(),
                    target: Pose::new(300.0, -20.5, 200.0),
                },
                Statement::Write {
                    device: "io".to_string(),
                    key: "gripper".to_string(),
                    value: Value::Bool(true),
                },
                Statement::Read {
                    device: "io".to_string(),
                    key: "part_present".to_string(),
                    variable: Some("present".to_string()),
                },
                Statement::Read {
                    device: "robot".to_string(),
                    key: "pose.x".to_string(),
                    variable: None,
                },
                Statement::Wait(Duration::from_millis(250)),
                Statement::Print("picked $present".to_string()),
            ]
        );
        assert_eq!(lines[0].number, 3);
    }

    #[test]
    fn should_locate_unknown_statement() {
        let err = parse("wait 10\n\n    jump robot").unwrap_err();
        assert_eq!(err.message(), "unknown statement `jump`");
        assert_eq!(location(&err), (3, 5));
    }

    #[test]
    fn should_locate_bad_number() {
        let err = parse("move robot 1 two 3").unwrap_err();
        assert_eq!(err.message(), "expected a number, found `two`");
        assert_eq!(location(&err), (1, 14));
    }

    #[test]
    fn should_reject_wrong_arity() {
        let err = parse("# header\nmove robot 1 2").unwrap_err();
        assert_eq!(err.message(), "`move` expects <robot> <x> <y> <z>");
        assert_eq!(location(&err), (2, 1));
    }

    #[test]
    fn should_keep_print_text_verbatim() {
        let lines = parse("print   hello,  world  ").unwrap();
        assert_eq!(lines[0].statement, Statement::Print("hello,  world".to_string()));
    }

    // ── Execution ──────────────────────────────────────────────────

    fn run(source: &str) -> (ProgramRunner, Result<(), CellError>) {
        let runner =
            ProgramRunner::new(cell(), Program::waypoints(source), WaypointExecutor).echo_stdout(false);
        let result = runner.start(true, None);
        (runner, result)
    }

    #[test]
    fn should_execute_program_against_cell() {
        let (runner, result) = run("
            move robot 100 0 0
            write io gripper true
            wait 20
            read io gripper gripped
            read io part_present present
            print part present: $present
            read robot pose.x
        ");

        result.unwrap();
        let record = runner.program_run();
        assert_eq!(record.state, ProgramRunState::Completed);
        assert_eq!(
            record.stdout.as_deref(),
            Some("part present: true\nrobot.pose.x = 100\n")
        );
        assert_eq!(record.store.get("gripped"), Some(&serde_json::json!(true)));
        assert_eq!(record.execution_results.len(), 1);
        assert_eq!(record.execution_results[0].trajectories.len(), 1);
    }

    #[test]
    fn should_fail_with_motion_error_out_of_reach() {
        let (runner, result) = run("move robot 5000 0 0");
        assert!(matches!(result, Err(CellError::Motion(_))));
        let record = runner.program_run();
        assert_eq!(record.state, ProgramRunState::Failed);
        assert_eq!(record.error_type.as_deref(), Some("MotionError"));
    }

    #[test]
    fn should_fail_for_unknown_device() {
        let (_runner, result) = run("write conveyor speed 3");
        assert!(matches!(result, Err(CellError::DeviceNotFound(_))));
    }

    #[test]
    fn should_record_parse_error_location() {
        let (runner, result) = run("print start\nmove robot 1 2");
        assert!(matches!(result, Err(CellError::Program(_))));
        let record = runner.program_run();
        let error = record.error_record.unwrap();
        assert_eq!(error.line, Some(2));
        assert_eq!(error.column, Some(1));
        assert_eq!(record.stdout.as_deref(), Some(""));
    }

    #[test]
    fn should_locate_runtime_program_errors() {
        let (runner, result) = run("wait 1\nread io missing");
        assert!(matches!(result, Err(CellError::Program(_))));
        assert_eq!(runner.program_run().error_record.unwrap().line, Some(2));
    }

    #[test]
    fn should_refuse_script_programs() {
        let result = run_program(
            cell(),
            Program::script("print(1)"),
            cellrun_app::runner::Arguments::new(),
            WaypointExecutor,
        );
        assert!(matches!(result, Err(CellError::Program(err)) if err.message() == "cannot execute script programs"));
    }

    #[test]
    fn should_stop_long_wait() {
        let runner = ProgramRunner::new(
            cell(),
            Program::waypoints("wait 3600000\nprint unreachable"),
            WaypointExecutor,
        )
        .echo_stdout(false);
        runner.start(false, None).unwrap();

        runner.stop(true).unwrap();

        let record = runner.program_run();
        assert_eq!(record.state, ProgramRunState::Stopped);
        assert_eq!(record.stdout.as_deref(), Some(""));
    }
}
