//! Parseo manual de argumentos: `jobhub-cli <comando> [--flag valor]...`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jobhub_core::JobStatus;
use serde_json::Value;
use uuid::Uuid;

pub const USAGE: &str = "\
Uso: jobhub-cli <comando> [opciones]
  run       --workflow <KEY> [--payload <JSON>] [--dedupe <ID>] [--at <RFC3339>] [--max-retries <N>]
  draft     --workflow <KEY> [--payload <JSON>]
  execute   --job <UUID>
  resume    --job <UUID> [--data <JSON>]
  cancel    --job <UUID>
  repeat    --workflow <KEY> --cron <EXPR> [--old <EXPR>] [--tz <TZ>] [--immediate] [--inactive]
  skip      --schedule <ID> [--count <N>]
  results   --job <UUID> [--step <NAME>]
  wait      --job <UUID> [--timeout-ms <N>]
  jobs      --workflow <KEY> [--status <STATUS>]
  workflows [--all]";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run {
        workflow: String,
        payload: Value,
        dedupe: Option<String>,
        at: Option<DateTime<Utc>>,
        max_retries: Option<u32>,
        draft: bool,
    },
    Execute { job: Uuid },
    Resume { job: Uuid, data: Option<Value> },
    Cancel { job: Uuid },
    Repeat {
        workflow: String,
        cron: String,
        old: Option<String>,
        tz: Option<String>,
        immediate: bool,
        active: bool,
    },
    Skip { schedule: i64, count: u32 },
    Results { job: Uuid, step: Option<String> },
    Wait { job: Uuid, timeout: Option<Duration> },
    Jobs { workflow: String, status: Option<JobStatus> },
    Workflows { all: bool },
}

/// Error de uso. `Json` se distingue para devolver otro código de salida.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    Usage(String),
    Json(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgsError::Usage(m) => write!(f, "{m}"),
            ArgsError::Json(m) => write!(f, "JSON inválido: {m}"),
        }
    }
}

const SWITCHES: [&str; 3] = ["--immediate", "--inactive", "--all"];

struct Flags {
    pairs: Vec<(String, String)>,
    switches: Vec<String>,
}

impl Flags {
    fn parse(rest: &[String]) -> Result<Self, ArgsError> {
        let mut pairs = Vec::new();
        let mut switches = Vec::new();
        let mut i = 0;
        while i < rest.len() {
            let flag = rest[i].as_str();
            if SWITCHES.contains(&flag) {
                switches.push(flag.to_string());
            } else if flag.starts_with("--") {
                i += 1;
                let value = rest.get(i).ok_or_else(|| ArgsError::Usage(format!("falta valor para {flag}")))?;
                pairs.push((flag.to_string(), value.clone()));
            } else {
                return Err(ArgsError::Usage(format!("argumento inesperado '{flag}'")));
            }
            i += 1;
        }
        Ok(Self { pairs, switches })
    }

    fn get(&self, flag: &str) -> Option<&str> {
        self.pairs.iter().rev().find(|(k, _)| k == flag).map(|(_, v)| v.as_str())
    }

    fn required(&self, flag: &str) -> Result<&str, ArgsError> {
        self.get(flag).ok_or_else(|| ArgsError::Usage(format!("falta {flag}")))
    }

    fn switch(&self, flag: &str) -> bool {
        self.switches.iter().any(|s| s == flag)
    }

    fn job(&self) -> Result<Uuid, ArgsError> {
        let raw = self.required("--job")?;
        Uuid::parse_str(raw).map_err(|_| ArgsError::Usage(format!("--job no es un UUID: '{raw}'")))
    }

    fn json(&self, flag: &str) -> Result<Option<Value>, ArgsError> {
        self.get(flag)
            .map(|raw| serde_json::from_str(raw).map_err(|e| ArgsError::Json(format!("{flag}: {e}"))))
            .transpose()
    }

    fn number<T: std::str::FromStr>(&self, flag: &str) -> Result<Option<T>, ArgsError> {
        self.get(flag)
            .map(|raw| raw.parse().map_err(|_| ArgsError::Usage(format!("{flag} no es un número: '{raw}'"))))
            .transpose()
    }
}

pub fn parse(args: &[String]) -> Result<Command, ArgsError> {
    let (cmd, rest) = args.split_first().ok_or_else(|| ArgsError::Usage("falta el comando".into()))?;
    let flags = Flags::parse(rest)?;
    let command = match cmd.as_str() {
        "run" | "draft" => {
            let at = flags.get("--at")
                          .map(|raw| {
                              DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc))
                                                               .map_err(|_| ArgsError::Usage(format!("--at no es RFC3339: '{raw}'")))
                          })
                          .transpose()?;
            Command::Run { workflow: flags.required("--workflow")?.to_string(),
                           payload: flags.json("--payload")?.unwrap_or(Value::Null),
                           dedupe: flags.get("--dedupe").map(str::to_string),
                           at,
                           max_retries: flags.number("--max-retries")?,
                           draft: cmd == "draft" }
        }
        "execute" => Command::Execute { job: flags.job()? },
        "resume" => Command::Resume { job: flags.job()?,
                                      data: flags.json("--data")? },
        "cancel" => Command::Cancel { job: flags.job()? },
        "repeat" => Command::Repeat { workflow: flags.required("--workflow")?.to_string(),
                                      cron: flags.required("--cron")?.to_string(),
                                      old: flags.get("--old").map(str::to_string),
                                      tz: flags.get("--tz").map(str::to_string),
                                      immediate: flags.switch("--immediate"),
                                      active: !flags.switch("--inactive") },
        "skip" => Command::Skip { schedule: flags.number("--schedule")?
                                                 .ok_or_else(|| ArgsError::Usage("falta --schedule".into()))?,
                                  count: flags.number("--count")?.unwrap_or(1) },
        "results" => Command::Results { job: flags.job()?,
                                        step: flags.get("--step").map(str::to_string) },
        "wait" => Command::Wait { job: flags.job()?,
                                  timeout: flags.number::<u64>("--timeout-ms")?.map(Duration::from_millis) },
        "jobs" => {
            let status = flags.get("--status")
                              .map(|raw| raw.to_ascii_uppercase().parse::<JobStatus>())
                              .transpose()
                              .map_err(|e| ArgsError::Usage(e.to_string()))?;
            Command::Jobs { workflow: flags.required("--workflow")?.to_string(),
                            status }
        }
        "workflows" => Command::Workflows { all: flags.switch("--all") },
        other => return Err(ArgsError::Usage(format!("comando desconocido '{other}'"))),
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn run_with_payload_and_dedupe() {
        let cmd = parse(&args(r#"run --workflow echo --payload {"n":1} --dedupe d-1 --max-retries 3"#)).unwrap();
        assert_eq!(cmd,
                   Command::Run { workflow: "echo".into(),
                                  payload: json!({"n": 1}),
                                  dedupe: Some("d-1".into()),
                                  at: None,
                                  max_retries: Some(3),
                                  draft: false });
    }

    #[test]
    fn draft_is_run_with_flag() {
        match parse(&args("draft --workflow approval")).unwrap() {
            Command::Run { draft, payload, .. } => {
                assert!(draft);
                assert_eq!(payload, Value::Null);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_json_and_missing_values_are_distinguished() {
        let id = Uuid::new_v4();
        assert!(matches!(parse(&args(&format!("resume --job {id} --data {{nope"))), Err(ArgsError::Json(_))));
        assert!(matches!(parse(&args("resume --job")), Err(ArgsError::Usage(_))));
        assert!(matches!(parse(&args("cancel --job not-a-uuid")), Err(ArgsError::Usage(_))));
        assert!(matches!(parse(&args("launch")), Err(ArgsError::Usage(_))));
        assert!(matches!(parse(&[]), Err(ArgsError::Usage(_))));
    }

    #[test]
    fn repeat_switches_and_skip_default() {
        let cmd = parse(&args("repeat --workflow wait --cron 0_*_*_*_* --immediate --inactive")).unwrap();
        assert!(matches!(cmd, Command::Repeat { immediate: true, active: false, .. }));
        assert_eq!(parse(&args("skip --schedule 4")).unwrap(), Command::Skip { schedule: 4, count: 1 });
    }

    #[test]
    fn jobs_status_is_case_insensitive() {
        let cmd = parse(&args("jobs --workflow echo --status waiting_rerun")).unwrap();
        assert_eq!(cmd,
                   Command::Jobs { workflow: "echo".into(),
                                   status: Some(JobStatus::WaitingRerun) });
        assert!(parse(&args("jobs --workflow echo --status nope")).is_err());
    }

    #[test]
    fn wait_timeout_and_scheduled_run() {
        let id = Uuid::new_v4();
        let cmd = parse(&args(&format!("wait --job {id} --timeout-ms 1500"))).unwrap();
        assert_eq!(cmd,
                   Command::Wait { job: id,
                                   timeout: Some(Duration::from_millis(1500)) });
        let cmd = parse(&args("run --workflow echo --at 2030-01-01T00:00:00Z")).unwrap();
        assert!(matches!(cmd, Command::Run { at: Some(_), .. }));
    }
}
