use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use scaffold_core::config;
use scaffold_core::container::Services;
use scaffold_core::logging;
use scaffold_core::models::CreateTask;
use scaffold_core::orchestration::{SampleExecutor, TaskExecutor};
use scaffold_core::session::RequestFacts;

type CliResult = Result<(), Box<dyn Error>>;

const USAGE: &str = "\
usage: scaffold <command> [options]

commands:
  demo     [--session KEY] [--steps N] [--delay-ms MS]   run a sample task and print it
  stats    [--session KEY]                               print session, task and sweeper stats
  resolve  [--header V] [--query V] [--cookie V] [--ip ADDR] [--user ID]
                                                         show which session a request maps to
  help                                                   print this message

configuration: SCAFFOLD_CONFIG names an optional TOML file; environment
variables such as MAX_SESSIONS or BE_LOG_LEVEL override it.";

enum Command {
    Demo {
        session: Option<String>,
        steps: u32,
        delay: Duration,
    },
    Stats {
        session: Option<String>,
    },
    Resolve(Vec<(String, String)>),
    Help,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    if matches!(command, Command::Help) {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let config = match config::load_from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::from(2);
        }
    };
    logging::init(&config.logging);

    let services = match Services::from_config(&config) {
        Ok(services) => services,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match command {
        Command::Demo {
            session,
            steps,
            delay,
        } => run_demo(&services, &session_or_default(&services, session), steps, delay).await,
        Command::Stats { session } => {
            run_stats(&services, &session_or_default(&services, session)).await
        }
        Command::Resolve(options) => run_resolve(&services, &options),
        Command::Help => Ok(()),
    };
    services.shutdown();

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(message = %error, "command failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run_demo(services: &Services, session: &str, steps: u32, delay: Duration) -> CliResult {
    services.start_background();
    let database = services.factory.open_database(session).await?;
    let task = services.registry.create_task(
        database.store.as_ref(),
        &database.key,
        CreateTask {
            description: Some(format!("{steps} evenly spaced steps")),
            ..CreateTask::named("Sample Task")
        },
    )?;

    let executor: Arc<dyn TaskExecutor> = Arc::new(SampleExecutor::new(steps, delay));
    services
        .coordinator
        .spawn_task(database.key.clone(), task.id.clone(), executor)
        .await?;

    let finished = services
        .registry
        .get_task(database.store.as_ref(), &database.key, &task.id)?;
    let stats = services
        .registry
        .task_stats(database.store.as_ref(), &database.key)?;
    if database.store.path().is_some() {
        database.store.save_db().await?;
    }

    print_json(&json!({ "task": finished, "stats": stats }))
}

async fn run_stats(services: &Services, session: &str) -> CliResult {
    let database = services.factory.open_database(session).await?;
    let tasks = services
        .registry
        .task_stats(database.store.as_ref(), &database.key)?;

    print_json(&json!({
        "session": database.key,
        "sessions": services.factory.stats()?,
        "tasks": tasks,
        "cleanup": services.sweeper.status(),
    }))
}

fn run_resolve(services: &Services, options: &[(String, String)]) -> CliResult {
    let names = services.resolver.config();
    let mut facts = RequestFacts::new();
    for (flag, value) in options {
        facts = match flag.as_str() {
            "--header" => facts.header(&names.header_name, value.clone()),
            "--query" => facts.query(names.query_param.clone(), value.clone()),
            "--cookie" => facts.cookie(names.cookie_name.clone(), value.clone()),
            "--ip" => facts.remote_addr(value.clone()),
            "--user" => facts.user(value.clone()),
            _ => facts,
        };
    }

    let resolved = services.resolver.resolve(&facts);
    print_json(&json!({
        "rawKey": resolved.raw_key,
        "source": resolved.source,
        "clientIp": facts.client_ip(),
        "ipMappings": services.resolver.ip_mappings(),
    }))
}

fn session_or_default(services: &Services, session: Option<String>) -> String {
    session.unwrap_or_else(|| services.resolver.config().default_session.clone())
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some((name, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    let options = parse_options(rest)?;

    match name.as_str() {
        "demo" => {
            let mut session = None;
            let mut steps = 5;
            let mut delay = Duration::from_millis(500);
            for (flag, value) in options {
                match flag.as_str() {
                    "--session" => session = Some(value),
                    "--steps" => steps = parse_number(&flag, &value)?,
                    "--delay-ms" => delay = Duration::from_millis(parse_number(&flag, &value)?),
                    _ => return Err(format!("unknown option '{flag}' for demo")),
                }
            }
            Ok(Command::Demo {
                session,
                steps,
                delay,
            })
        }
        "stats" => {
            let mut session = None;
            for (flag, value) in options {
                match flag.as_str() {
                    "--session" => session = Some(value),
                    _ => return Err(format!("unknown option '{flag}' for stats")),
                }
            }
            Ok(Command::Stats { session })
        }
        "resolve" => {
            if let Some((flag, _)) = options.iter().find(|(flag, _)| {
                !matches!(
                    flag.as_str(),
                    "--header" | "--query" | "--cookie" | "--ip" | "--user"
                )
            }) {
                return Err(format!("unknown option '{flag}' for resolve"));
            }
            Ok(Command::Resolve(options))
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_options(args: &[String]) -> Result<Vec<(String, String)>, String> {
    let mut options = Vec::new();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        if !flag.starts_with("--") {
            return Err(format!("unexpected argument '{flag}'"));
        }
        let value = iter
            .next()
            .ok_or_else(|| format!("option '{flag}' requires a value"))?;
        options.push((flag.clone(), value.clone()));
    }
    Ok(options)
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("option '{flag}' expects a number, got '{value}'"))
}
