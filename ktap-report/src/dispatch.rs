// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, IncompleteReason, KtapExitCode, Result},
    output::{OutputContext, OutputOpts, OutputWriter, StdoutWriter, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use ktap_parser::{
    KtapResult, KtapStreamBuilder, ParseMode, ParserOptions, StreamOutcome, StreamParser,
    StreamSource,
    config::{ConfigLocation, KtapConfig},
    junit::{self, JunitReportBuilder},
    reporter::ResultReporter,
};
use owo_colors::OwoColorize;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// How often `watch` checks for new results.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Collect and report KUnit results from KTAP streams and the kernel log.
#[derive(Debug, Parser)]
#[command(version, name = "ktap-report", styles = clap_styles::style())]
pub struct KtapReportApp {
    #[command(flatten)]
    output: OutputOpts,

    /// Config file [default: ktap-report.toml if present; `none` to skip]
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "KTAP_REPORT_CONFIG"
    )]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl KtapReportApp {
    /// Initializes logging and returns the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        let config = KtapConfig::from_location(ConfigLocation::from_cli_or_env(
            self.config.as_deref(),
        ))?;
        debug!(?config, verbose = output.verbose, "loaded configuration");

        match self.command {
            Command::Parse(opts) => opts.exec(&config, output, output_writer),
            Command::Watch(opts) => opts.exec(&config, output, output_writer),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse a saved KTAP report or kernel log
    ///
    /// Prints one line per test case and a summary. The exit code is 100 if any test case
    /// failed and 106 if the input ended before the report was complete.
    Parse(ParseOpts),

    /// Follow the kernel log and report results as tests run
    ///
    /// By default, only messages logged after the watch starts are read. Use --from-start to
    /// read the whole kernel log buffer.
    Watch(WatchOpts),
}

#[derive(Debug, Args)]
struct ReportOpts {
    /// Write a JUnit report to this path [default: from config]
    #[arg(long, value_name = "PATH")]
    junit: Option<Utf8PathBuf>,
}

impl ReportOpts {
    fn junit_path<'a>(&'a self, config: &'a KtapConfig) -> Option<&'a Utf8Path> {
        self.junit.as_deref().or(config.junit.path.as_deref())
    }
}

#[derive(Debug, Args)]
struct ParseOpts {
    /// KTAP file to parse, or `-` for standard input [default: -]
    #[arg(value_name = "INPUT")]
    input: Option<Utf8PathBuf>,

    /// Skip lines that are not part of KTAP
    #[arg(long)]
    tolerant: bool,

    /// Treat the input as records read from /dev/kmsg
    ///
    /// Implies --tolerant, since the kernel log interleaves unrelated messages.
    #[arg(long)]
    kmsg: bool,

    #[command(flatten)]
    report_opts: ReportOpts,
}

impl ParseOpts {
    fn exec(
        self,
        config: &KtapConfig,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let input_path = self
            .input
            .as_deref()
            .filter(|path| path.as_str() != "-");
        let mut reader: Box<dyn Read> = match input_path {
            Some(path) => Box::new(File::open(path).map_err(|err| ExpectedError::InputOpen {
                path: path.to_owned(),
                err,
            })?),
            None => Box::new(io::stdin().lock()),
        };
        let input_name = input_path.map_or("standard input", Utf8Path::as_str);

        let source = if self.kmsg {
            StreamSource::Kmsg
        } else {
            StreamSource::Plain
        };
        let options = parser_options(config, source, self.tolerant);
        write_heading(output_writer, output, "Parsing", input_name)?;

        let mut reporter =
            ResultReporter::new(output_writer.stdout_writer(), output.colorize_stdout());
        let mut parser = StreamParser::new(source, options, Vec::new());
        let mut buf = vec![0; config.stream.read_buffer_size];
        let mut reported = 0;

        let run_result = loop {
            let (status, at_eof) = match reader.read(&mut buf) {
                // Terminate a trailing line that has no newline.
                Ok(0) => (parser.process(b"\n"), true),
                Ok(n) => (parser.process(&buf[..n]), false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(ExpectedError::Read { err }),
            };

            let results = parser.parser().sink();
            report_results(&mut reporter, &results[reported..])?;
            reported = results.len();

            match status {
                Ok(status) if status.is_done() => break Ok(None),
                Ok(_) if at_eof => break Ok(Some(IncompleteReason::EndOfInput)),
                Ok(_) => {}
                Err(err) => break Err(ExpectedError::Parse { err }),
            }
        };

        finish_run(
            reporter,
            parser.parser().sink(),
            self.report_opts.junit_path(config),
            config,
            run_result,
        )
    }
}

#[derive(Debug, Args)]
struct WatchOpts {
    /// Kernel log device to read from
    #[arg(long, value_name = "PATH", default_value = "/dev/kmsg")]
    device: Utf8PathBuf,

    /// Read the whole kernel log buffer, not just new messages
    #[arg(long)]
    from_start: bool,

    /// Stop waiting after this long, e.g. `30s` or `5m`
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Read plain lines instead of kmsg records [default: from config]
    #[arg(long)]
    plain: bool,

    /// Skip lines that are not part of KTAP (always on for kmsg records)
    #[arg(long)]
    tolerant: bool,

    #[command(flatten)]
    report_opts: ReportOpts,
}

impl WatchOpts {
    fn exec(
        self,
        config: &KtapConfig,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let source = if self.plain {
            StreamSource::Plain
        } else {
            config.stream.source
        };

        let mut file = open_device(&self.device).map_err(|err| ExpectedError::InputOpen {
            path: self.device.clone(),
            err,
        })?;
        if !self.from_start {
            // On /dev/kmsg, this skips to just after the most recent record.
            file.seek(SeekFrom::End(0))
                .map_err(|err| ExpectedError::InputOpen {
                    path: self.device.clone(),
                    err,
                })?;
        }

        let stream = KtapStreamBuilder::new()
            .set_source(source)
            .set_parser_options(parser_options(config, source, self.tolerant))
            .set_read_buffer_size(config.stream.read_buffer_size)
            .spawn(file)
            .map_err(|err| ExpectedError::StreamSpawn { err })?;
        let results = stream.results().clone();
        write_heading(output_writer, output, "Watching", self.device.as_str())?;

        let mut reporter =
            ResultReporter::new(output_writer.stdout_writer(), output.colorize_stdout());
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut reported = 0;
        loop {
            // Check this before taking the snapshot, so no results are missed after the worker
            // exits.
            let finished = !stream.is_running();
            let new_results = results.snapshot_from(reported);
            reported += new_results.len();
            report_results(&mut reporter, &new_results)?;

            if finished {
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!("watch timed out, cancelling stream");
                stream.cancel();
            }
            thread::sleep(WATCH_POLL_INTERVAL);
        }

        let run_result = match stream.join() {
            Ok(StreamOutcome::Completed) => Ok(None),
            Ok(StreamOutcome::EndOfInput) => Ok(Some(IncompleteReason::EndOfInput)),
            Ok(StreamOutcome::Cancelled) => Ok(Some(IncompleteReason::Cancelled)),
            Err(err) => Err(ExpectedError::stream_error(err)),
        };
        finish_run(
            reporter,
            &results.snapshot(),
            self.report_opts.junit_path(config),
            config,
            run_result,
        )
    }
}

/// Kernel log records interleave unrelated messages, so kmsg sources are always parsed
/// tolerantly.
fn parser_options(config: &KtapConfig, source: StreamSource, tolerant: bool) -> ParserOptions {
    let mut options = config.parser;
    if tolerant || source == StreamSource::Kmsg {
        options.mode = ParseMode::Tolerant;
    }
    options
}

fn open_device(path: &Utf8Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        // Reads from /dev/kmsg block until a new record arrives, which would keep the worker from
        // noticing cancellation.
        options.custom_flags(libc::O_NONBLOCK);
    }
    options.open(path)
}

fn write_heading(
    output_writer: &mut OutputWriter,
    output: OutputContext,
    heading: &str,
    target: &str,
) -> Result<()> {
    let styles = output.stderr_styles();
    let mut writer = output_writer.stderr_writer();
    writeln!(writer, "{:>12} {target}", heading.style(styles.bold))
        .and_then(|()| writer.flush())
        .map_err(|err| ExpectedError::WriteOutput { err })
}

fn report_results(
    reporter: &mut ResultReporter<StdoutWriter<'_>>,
    results: &[KtapResult],
) -> Result<()> {
    for result in results {
        reporter
            .report(result)
            .map_err(|err| ExpectedError::WriteOutput { err })?;
    }
    Ok(())
}

/// Prints the summary and writes the JUnit report, then turns the run into an exit code.
///
/// Results parsed before an error are still summarized and written out.
fn finish_run(
    reporter: ResultReporter<StdoutWriter<'_>>,
    results: &[KtapResult],
    junit_path: Option<&Utf8Path>,
    config: &KtapConfig,
    run_result: Result<Option<IncompleteReason>>,
) -> Result<i32> {
    let summary = reporter
        .finish()
        .map_err(|err| ExpectedError::WriteOutput { err })?;

    if let Some(path) = junit_path {
        let report = JunitReportBuilder::new(config.junit.report_name.as_str())
            .add_results(results)
            .build();
        junit::write_to_path(&report, path)?;
        info!("wrote JUnit report to {path}");
    }

    let incomplete = run_result?;
    if !summary.is_success() {
        return Err(ExpectedError::TestsFailed {
            failed: summary.failed,
        });
    }
    if let Some(reason) = incomplete {
        return Err(ExpectedError::IncompleteRun { reason });
    }
    Ok(KtapExitCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use clap::CommandFactory;
    use indoc::indoc;
    use ktap_parser::errors::{KtapParseError, ProtocolErrorKind};
    use pretty_assertions::assert_eq;

    fn fixture(name: &str) -> String {
        format!("{}/../fixtures/ktap/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    fn run(args: &[&str]) -> (Result<i32>, String, String) {
        let app = KtapReportApp::try_parse_from(
            ["ktap-report", "--color", "never", "--config", "none"]
                .iter()
                .chain(args),
        )
        .expect("arguments are valid");
        let output = app.init_output();

        let mut output_writer = OutputWriter::Test {
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let result = app.exec(output, &mut output_writer);
        let OutputWriter::Test { stdout, stderr } = output_writer else {
            unreachable!("test writer was passed in");
        };
        (
            result,
            String::from_utf8(stdout).expect("stdout is UTF-8"),
            String::from_utf8(stderr).expect("stderr is UTF-8"),
        )
    }

    const KUNIT_RESULTS_OUTPUT: &str = indoc! {"
                PASS drm_buddy::drm_test_buddy_alloc_limit
                PASS drm_buddy::drm_test_buddy_alloc_range_bias
                FAIL drm_buddy::drm_test_buddy_alloc_clear: expected 0, got -12
                PASS drm_mm::drm_test_mm_init
                SKIP drm_mm::drm_test_mm_debug: requires CONFIG_DRM_DEBUG_MM
        ------------
             Summary 5 tests run: 3 passed, 1 failed, 1 skipped
    "};

    #[test]
    fn parse_reports_failures() {
        let input = fixture("kunit-results.ktap");
        let (result, stdout, stderr) = run(&["parse", &input]);

        let error = result.expect_err("a test case failed");
        assert!(
            matches!(error, ExpectedError::TestsFailed { failed: 1 }),
            "unexpected error: {error:?}"
        );
        assert_eq!(error.process_exit_code(), KtapExitCode::TESTS_FAILED);
        assert_eq!(stdout, KUNIT_RESULTS_OUTPUT);
        assert_eq!(stderr, format!("     Parsing {input}\n"));
    }

    #[test]
    fn parse_writes_junit() {
        let dir = Utf8TempDir::new().expect("temp dir created");
        let junit_path = dir.path().join("out/junit.xml");
        let (result, _, _) = run(&[
            "parse",
            &fixture("kunit-results.ktap"),
            "--junit",
            junit_path.as_str(),
        ]);
        assert!(matches!(result, Err(ExpectedError::TestsFailed { .. })));

        let xml = std::fs::read_to_string(&junit_path).expect("JUnit report written");
        assert!(xml.contains(r#"<testsuites name="ktap""#), "{xml}");
        assert!(xml.contains(r#"<testsuite name="drm_buddy""#), "{xml}");
        assert!(xml.contains(r#"<testsuite name="drm_mm""#), "{xml}");
    }

    #[test]
    fn parse_missing_header() {
        let (result, stdout, _) = run(&["parse", &fixture("missing-header.ktap")]);
        assert_eq!(result.expect("all tests passed"), KtapExitCode::OK);
        assert!(
            stdout.contains("PASS drm_format::drm_test_format_block_width"),
            "{stdout}"
        );
        assert!(stdout.contains("2 tests run: 2 passed, 0 skipped"), "{stdout}");
    }

    #[test]
    fn parse_protocol_error() {
        let (result, _, _) = run(&["parse", &fixture("protocol-error.ktap")]);
        let error = result.expect_err("protocol error");
        assert_eq!(error.process_exit_code(), KtapExitCode::PROTOCOL_ERROR);
        assert!(
            matches!(
                error,
                ExpectedError::Parse {
                    err: KtapParseError::Protocol {
                        line_number: 4,
                        kind: ProtocolErrorKind::PlanBeforeName,
                        ..
                    }
                }
            ),
            "unexpected error: {error:?}"
        );
    }

    #[test]
    fn parse_incomplete_input() {
        let dir = Utf8TempDir::new().expect("temp dir created");
        let path = dir.path().join("incomplete.ktap");
        std::fs::write(
            &path,
            "KTAP version 1\n1..2\n    KTAP version 1\n    # Subtest: s\n    1..1\n    ok 1 c\nok 1 s",
        )
        .expect("input written");

        let (result, stdout, _) = run(&["parse", path.as_str()]);
        let error = result.expect_err("report is incomplete");
        assert!(
            matches!(
                error,
                ExpectedError::IncompleteRun {
                    reason: IncompleteReason::EndOfInput
                }
            ),
            "unexpected error: {error:?}"
        );
        assert_eq!(error.process_exit_code(), KtapExitCode::INCOMPLETE_RUN);
        assert!(stdout.contains("PASS s::c"), "{stdout}");
    }

    #[test]
    fn parse_kmsg() {
        let (result, stdout, _) = run(&["parse", "--kmsg", &fixture("kmsg-results.txt")]);
        assert_eq!(result.expect("all tests passed"), KtapExitCode::OK);
        assert_eq!(
            stdout,
            indoc! {"
                        PASS drm_mm::drm_test_mm_init
                        PASS drm_mm::drm_test_mm_debug
                ------------
                     Summary 2 tests run: 2 passed, 0 skipped
            "}
        );
    }

    #[test]
    fn parse_missing_input() {
        let (result, _, _) = run(&["parse", "does-not-exist.ktap"]);
        let error = result.expect_err("input is missing");
        assert!(
            matches!(error, ExpectedError::InputOpen { ref path, .. } if path.as_str() == "does-not-exist.ktap"),
            "unexpected error: {error:?}"
        );
        assert_eq!(error.process_exit_code(), KtapExitCode::SETUP_ERROR);
    }

    #[test]
    fn watch_file_from_start() {
        let device = fixture("kmsg-results.txt");
        let (result, stdout, stderr) = run(&["watch", "--device", &device, "--from-start"]);
        assert_eq!(result.expect("all tests passed"), KtapExitCode::OK);
        assert!(stdout.contains("2 tests run: 2 passed, 0 skipped"), "{stdout}");
        assert_eq!(stderr, format!("    Watching {device}\n"));
    }

    #[test]
    fn watch_plain_end_of_input() {
        let (result, stdout, _) = run(&[
            "watch",
            "--plain",
            "--device",
            &fixture("missing-header.ktap"),
        ]);

        // Without --from-start, the watch begins at the end of the file.
        let error = result.expect_err("nothing was read");
        assert!(
            matches!(
                error,
                ExpectedError::IncompleteRun {
                    reason: IncompleteReason::EndOfInput
                }
            ),
            "unexpected error: {error:?}"
        );
        assert!(stdout.contains("0 tests run"), "{stdout}");
    }

    #[test]
    fn config_file_is_applied() {
        let dir = Utf8TempDir::new().expect("temp dir created");
        let config_path = dir.path().join("ktap-report.toml");
        let junit_path = dir.path().join("junit.xml");
        std::fs::write(
            &config_path,
            format!("[junit]\npath = \"{junit_path}\"\nreport-name = \"kunit\"\n"),
        )
        .expect("config written");

        let app = KtapReportApp::try_parse_from([
            "ktap-report",
            "--color",
            "never",
            "--config",
            config_path.as_str(),
            "parse",
            &fixture("missing-header.ktap"),
        ])
        .expect("arguments are valid");
        let output = app.init_output();
        let mut output_writer = OutputWriter::Test {
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert_eq!(
            app.exec(output, &mut output_writer).expect("all tests passed"),
            KtapExitCode::OK
        );

        let xml = std::fs::read_to_string(&junit_path).expect("JUnit report written");
        assert!(xml.contains(r#"<testsuites name="kunit""#), "{xml}");
    }

    #[test]
    fn global_options_read_own_env_vars() {
        let command = KtapReportApp::command();
        let envs: Vec<_> = command
            .get_arguments()
            .filter_map(|arg| {
                let env = arg.get_env()?.to_str()?;
                Some((arg.get_id().as_str(), env))
            })
            .collect();
        assert_eq!(
            envs,
            vec![
                ("verbose", "KTAP_REPORT_VERBOSE"),
                ("color", "KTAP_REPORT_COLOR"),
                ("config", "KTAP_REPORT_CONFIG"),
            ]
        );
    }
}
