use std::{
    io,
    process::{ExitStatus, Stdio},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use soa_service_sdk::{
    async_trait, CancellationToken, ExportedType, FromLogger, InvokeError, ServiceModule,
    UserLogger, UserService,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
};
use tracing::Instrument;

use crate::{
    config::{ProcessServiceOptions, ProcessServiceOverrides},
    error::ConfigError,
};

/// Name the built-in process module is registered under.
pub const MODULE_NAME: &str = "cgi";

/// Outcome of one child process run, serialized as the invocation response.
///
/// A non-zero exit code is an ordinary result. `exception` is only set when
/// the run itself went wrong (spawn failure, broken pipes, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl InvocationResult {
    pub fn is_soft_failure(&self) -> bool {
        self.exception.is_some()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// User service that runs a configured program once per invocation,
/// feeding the payload to its stdin and capturing stdout/stderr.
pub struct ProcessService {
    options: ProcessServiceOptions,
    logger: UserLogger,
}

enum Fault {
    Cancelled,
    Error(anyhow::Error),
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Fault::Error(err)
    }
}

impl ProcessService {
    pub fn new(options: ProcessServiceOptions, logger: UserLogger) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self { options, logger })
    }

    pub fn options(&self) -> &ProcessServiceOptions {
        &self.options
    }

    /// Builder for the `cgi` module. The service it exports reads its settings
    /// from the process environment when constructed, `overrides` taking precedence.
    pub fn module(
        overrides: ProcessServiceOverrides,
    ) -> impl Fn() -> anyhow::Result<ServiceModule> + Send + Sync + 'static {
        move || {
            let service = if overrides == ProcessServiceOverrides::default() {
                ExportedType::service::<ProcessService>()
            } else {
                let overrides = overrides.clone();
                ExportedType::with_constructor(
                    std::any::type_name::<ProcessService>(),
                    move |logger| {
                        let options = ProcessServiceOptions::from_process_environment(&overrides)?;
                        let service = ProcessService::new(options, logger)?;
                        Ok(Box::new(service) as Box<dyn UserService>)
                    },
                )
            };
            Ok(ServiceModule::new(MODULE_NAME)
                .export(ExportedType::opaque(
                    std::any::type_name::<InvocationResult>(),
                ))
                .export(service))
        }
    }

    pub fn logger(&self) -> &UserLogger {
        &self.logger
    }

    /// Runs the program once. Only cancellation escapes as an error; every
    /// other fault is folded into the returned result with whatever output
    /// was captured before it happened.
    pub async fn call(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, InvokeError> {
        if cancel.is_cancelled() {
            metrics::counter!("soa_process_invocations_total", "outcome" => "cancelled")
                .increment(1);
            return Err(InvokeError::Cancelled);
        }

        let mut child = None;
        let mut stdout = String::new();
        let mut stderr = String::new();
        let outcome = self
            .run(input, cancel, &mut child, &mut stdout, &mut stderr)
            .await;

        match outcome {
            Ok(status) => {
                metrics::counter!("soa_process_invocations_total", "outcome" => "exited")
                    .increment(1);
                self.logger
                    .debug(format_args!("process exited with {status}"));
                Ok(InvocationResult {
                    exit_code: status.code(),
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                    exception: None,
                })
            }
            Err(Fault::Cancelled) => {
                metrics::counter!("soa_process_invocations_total", "outcome" => "cancelled")
                    .increment(1);
                // The child keeps running; tokio reaps it once it exits.
                self.logger.warn("invocation cancelled before the process exited");
                Err(InvokeError::Cancelled)
            }
            Err(Fault::Error(err)) => {
                metrics::counter!("soa_process_invocations_total", "outcome" => "soft_failure")
                    .increment(1);
                self.logger
                    .warn(format_args!("process invocation failed: {err:#}"));
                let exit_code = child
                    .as_mut()
                    .and_then(|child| child.try_wait().ok().flatten())
                    .and_then(|status| status.code());
                Ok(InvocationResult {
                    exit_code,
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                    exception: Some(format!("{err:?}")),
                })
            }
        }
    }

    async fn run(
        &self,
        input: &str,
        cancel: &CancellationToken,
        slot: &mut Option<Child>,
        stdout: &mut String,
        stderr: &mut String,
    ) -> Result<ExitStatus, Fault> {
        let mut command = self.command()?;
        let child = slot.insert(
            command
                .spawn()
                .with_context(|| format!("failed to start `{}`", self.options.command))?,
        );
        let out_pipe = child.stdout.take().context("child stdout is not piped")?;
        let err_pipe = child.stderr.take().context("child stderr is not piped")?;
        let in_pipe = child.stdin.take().context("child stdin is not piped")?;

        // Output drains are polled before stdin is written so a child that
        // fills its output pipe never blocks the write.
        let exchange = async {
            tokio::try_join!(
                drain_lines(out_pipe, stdout),
                drain_lines(err_pipe, stderr),
                async {
                    feed_stdin(in_pipe, input, &self.logger).await?;
                    child.wait().await.context("failed to wait for process exit")
                },
            )
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Fault::Cancelled),
            joined = exchange => joined
                .map(|(_, _, status)| status)
                .map_err(Fault::Error),
        }
    }

    fn command(&self) -> anyhow::Result<Command> {
        let args = match self.options.arguments.as_deref() {
            Some(raw) if !raw.trim().is_empty() => shlex::split(raw)
                .with_context(|| format!("malformed argument string `{raw}`"))?,
            _ => Vec::new(),
        };
        let mut command = Command::new(&self.options.command);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Cancellation abandons the wait but leaves the child alive.
            .kill_on_drop(false);
        Ok(command)
    }
}

impl FromLogger for ProcessService {
    fn from_logger(logger: UserLogger) -> anyhow::Result<Self> {
        let options =
            ProcessServiceOptions::from_process_environment(&ProcessServiceOverrides::default())?;
        Ok(ProcessService::new(options, logger)?)
    }
}

#[async_trait]
impl UserService for ProcessService {
    async fn invoke(&self, input: &str, cancel: &CancellationToken) -> Result<String, InvokeError> {
        let span = self.logger.span().clone();
        async {
            self.logger
                .debug(format_args!("invoke: {} bytes of input", input.len()));
            let result = self.call(input, cancel).await?;
            let json = result
                .to_json()
                .context("failed to serialize invocation result")?;
            Ok::<_, InvokeError>(json)
        }
        .instrument(span)
        .await
    }
}

async fn drain_lines<R>(pipe: R, sink: &mut String) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .context("failed to read process output")?;
        if read == 0 {
            return Ok(());
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        sink.push_str(&String::from_utf8_lossy(&line));
        sink.push('\n');
    }
}

async fn feed_stdin(mut stdin: ChildStdin, input: &str, logger: &UserLogger) -> anyhow::Result<()> {
    let written = async {
        stdin.write_all(input.as_bytes()).await?;
        stdin.flush().await
    };
    match written.await {
        Ok(()) => {}
        // Unlike other write errors, a closed stdin does not set `exception`.
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            logger.debug("process closed stdin before consuming all input");
        }
        Err(err) => return Err(err).context("failed to write process stdin"),
    }
    // Dropping the handle closes the pipe and signals end of input.
    drop(stdin);
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use tokio::task::JoinSet;

    fn service(command: &str, arguments: Option<&str>) -> ProcessService {
        let mut options = ProcessServiceOptions::new(command);
        options.arguments = arguments.map(str::to_string);
        ProcessService::new(options, UserLogger::new("test::ProcessService")).unwrap()
    }

    fn normalized(input: &str) -> String {
        input.lines().map(|line| format!("{line}\n")).collect()
    }

    async fn parsed(service: &ProcessService, input: &str) -> InvocationResult {
        let raw = service
            .invoke(input, &CancellationToken::new())
            .await
            .unwrap();
        InvocationResult::from_json(&raw).unwrap()
    }

    #[tokio::test]
    async fn echo_returns_input_on_stdout() {
        let cat = service("cat", None);
        for input in ["", "hello", "line one\nline two\n", "crlf\r\nlines", "ünïcødé ✓"] {
            let result = parsed(&cat, input).await;
            assert_eq!(result.stdout.as_deref(), Some(normalized(input).as_str()));
            assert_eq!(result.stderr.as_deref(), Some(""));
            assert_eq!(result.exit_code, Some(0));
            assert!(result.exception.is_none(), "{:?}", result.exception);
        }
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_a_failure() {
        let sh = service("sh", Some("-c 'echo oops >&2; exit 3'"));
        let result = parsed(&sh, "ignored").await;
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr.as_deref(), Some("oops\n"));
        assert_eq!(result.stdout.as_deref(), Some(""));
        assert!(!result.is_soft_failure());
    }

    #[tokio::test]
    async fn missing_program_is_a_soft_failure() {
        let missing = service("/nonexistent/definitely-not-a-program", None);
        let raw = missing
            .invoke("payload", &CancellationToken::new())
            .await
            .unwrap();
        let result = InvocationResult::from_json(&raw).unwrap();
        assert!(result.exit_code.is_none());
        let exception = result.exception.unwrap();
        assert!(exception.contains("failed to start"), "{exception}");
    }

    #[tokio::test]
    async fn malformed_arguments_are_a_soft_failure() {
        let sh = service("sh", Some("-c 'unterminated"));
        let result = parsed(&sh, "").await;
        assert!(result.exit_code.is_none());
        assert!(result.exception.unwrap().contains("malformed argument string"));
    }

    #[tokio::test]
    async fn cancellation_propagates_instead_of_a_result() {
        let sleeper = Arc::new(service("sleep", Some("5")));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(3), sleeper.invoke("", &cancel))
            .await
            .expect("cancellation should end the wait promptly");
        assert!(matches!(outcome, Err(InvokeError::Cancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_token_spawns_nothing() {
        let cat = service("cat", None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cat.call("x", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_invocations_do_not_mix_output() {
        let cat = Arc::new(service("cat", None));
        let mut set = JoinSet::new();
        for i in 0..50 {
            let cat = cat.clone();
            set.spawn(async move {
                let input = format!("payload-{i}\nsecond-{i}");
                let result = cat.call(&input, &CancellationToken::new()).await.unwrap();
                (input, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            let (input, result) = joined.unwrap();
            assert_eq!(result.stdout, Some(normalized(&input)));
            assert_eq!(result.exit_code, Some(0));
        }
    }

    #[tokio::test]
    async fn repeated_invocations_are_identical() {
        let cat = service("cat", None);
        let first = parsed(&cat, "same input").await;
        let second = parsed(&cat, "same input").await;
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.exit_code, second.exit_code);
    }

    #[tokio::test]
    async fn large_payload_does_not_deadlock() {
        let cat = service("cat", None);
        let input = "0123456789abcdef\n".repeat(64 * 1024);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            cat.call(&input, &CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.stdout.map(|s| s.len()), Some(input.len()));
    }

    #[tokio::test]
    async fn child_ignoring_stdin_still_reports_exit() {
        let sh = service("sh", Some("-c 'echo done'"));
        let input = "x".repeat(1024 * 1024);
        let result = sh.call(&input, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.as_deref(), Some("done\n"));
        assert!(result.exception.is_none());
    }

    #[tokio::test]
    async fn builtin_module_loads_through_the_loader() {
        let overrides = ProcessServiceOverrides {
            command: Some("cat".into()),
            arguments: None,
        };
        let loader = crate::UserServiceLoader::new(
            crate::ServiceLoaderOptions::new("/opt/services/cgi.dll"),
            Arc::new(crate::builtin_catalog(overrides)),
        )
        .unwrap();
        let service = loader.create_service_instance().unwrap();
        let raw = service
            .invoke("via loader", &CancellationToken::new())
            .await
            .unwrap();
        let result = InvocationResult::from_json(&raw).unwrap();
        assert_eq!(result.stdout.as_deref(), Some("via loader\n"));
    }

    #[tokio::test]
    async fn module_without_overrides_exports_the_service_type() {
        std::env::set_var("CGI_COMMAND", "cat");
        let module = ProcessService::module(ProcessServiceOverrides::default())().unwrap();
        let export = module.find_service_type().unwrap();
        assert_eq!(export.name(), std::any::type_name::<ProcessService>());

        let service = ProcessService::from_logger(UserLogger::new(export.name())).unwrap();
        assert_eq!(service.logger().service(), export.name());
        assert_eq!(service.options().command, "cat");

        let loader = crate::UserServiceLoader::new(
            crate::ServiceLoaderOptions::new("cgi"),
            Arc::new(crate::builtin_catalog(ProcessServiceOverrides::default())),
        )
        .unwrap();
        let raw = loader
            .create_service_instance()
            .unwrap()
            .invoke("from env", &CancellationToken::new())
            .await
            .unwrap();
        let result = InvocationResult::from_json(&raw).unwrap();
        assert_eq!(result.stdout.as_deref(), Some("from env\n"));
    }

    #[test]
    fn wire_shape_uses_literal_field_names() {
        let ok = InvocationResult {
            exit_code: Some(0),
            stdout: Some("out\n".into()),
            stderr: None,
            exception: None,
        };
        let value: serde_json::Value = serde_json::from_str(&ok.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "exitCode": 0, "stdout": "out\n", "stderr": null })
        );

        let failed = InvocationResult {
            exception: Some("boom".into()),
            ..InvocationResult::default()
        };
        let value: serde_json::Value =
            serde_json::from_str(&failed.to_json().unwrap()).unwrap();
        assert_eq!(value["exception"], "boom");
        assert!(value["exitCode"].is_null());
    }

    #[test]
    fn blank_command_is_rejected() {
        let result = ProcessService::new(ProcessServiceOptions::new(" "), UserLogger::new("x"));
        assert!(matches!(result, Err(ConfigError::Missing { key: "command" })));
    }
}
