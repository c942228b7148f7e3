// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

mod cmdline;

use std::env;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use cmdline::ArgsParse;
use hal::config::HalConfig;
use hal::format::HalPixelFormat;
use hal::provider::CameraProvider;
use hal::request::{CaptureRequest, RequestTemplate};
use hal::session::{CameraCallback, CaptureResult, NotifyMsg};
use hal::stream::{StreamDescriptor, StreamDirection};

const BINARY_NAME: &str = "uvc-camera-hal";
const DEFAULT_CONFIG: &str = "uvc-camera-hal.json";

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!(
            "{0}: Not enough arguments\n\
            Try '{0} --help' for more information",
            BINARY_NAME
        );
        return;
    }

    let opt = args[1].clone();

    match opt.as_str() {
        "list" => {
            if let Err(e) = run_list(args[2..].to_vec()) {
                println!("{}: {:?}", BINARY_NAME, e);
            }
        }
        "dump" => {
            if let Err(e) = run_dump(args[2..].to_vec()) {
                println!("{}: {:?}", BINARY_NAME, e);
            }
        }
        "capture" => {
            if let Err(e) = run_capture(args[2..].to_vec()) {
                println!("{}: {:?}", BINARY_NAME, e);
            }
        }
        "-v" | "--version" => {
            println!("{} version {}", BINARY_NAME, util::VERSION);
        }
        "-h" | "--help" => {
            print_help();
        }
        _ => {
            println!(
                "{}: Command not found: {}\n\
                Try '{} --help' for more information.",
                BINARY_NAME,
                opt.as_str(),
                BINARY_NAME
            );
        }
    }
}

fn print_help() {
    print!(
        "Usage: {} COMMAND [OPTIONS]\n\
        Inspect and exercise the UVC camera HAL from the command line.\n\n\
        Commands:\n\
        \x20 list                      list the available camera ids\n\
        \x20 dump CAMERA_ID            print the static capabilities of one camera\n\
        \x20 capture CAMERA_ID COUNT   run COUNT capture requests and report results\n\n\
        Options:\n\
        \x20 --config FILE             camera configuration (default {})\n\
        \x20 --logfile FILE            append logs to FILE instead of stderr\n\
        \x20 -h, --help                display this help and exit\n\
        \x20 -v, --version             output version information and exit\n",
        BINARY_NAME, DEFAULT_CONFIG
    );
}

/// Parse the shared options, initialize logging and build the provider.
fn setup(args: Vec<String>) -> Result<(Arc<CameraProvider>, Vec<String>)> {
    let mut parser = ArgsParse::create(vec![], vec!["config", "logfile"]);
    parser.parse(args)?;

    let logfile = match parser.value_of("logfile") {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path))?,
        ) as Box<dyn std::io::Write + Send>,
        None => Box::new(std::io::stderr()),
    };
    util::logger::init_logger_with_env(Some(logfile))
        .with_context(|| "Failed to initialize logger")?;

    let config_path = parser
        .value_of("config")
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = HalConfig::from_file(Path::new(&config_path))?;
    let provider = CameraProvider::from_config(&config, None)?;
    Ok((provider, parser.free))
}

fn run_list(args: Vec<String>) -> Result<()> {
    let (provider, _) = setup(args)?;
    let ids = provider.list_cameras();
    if ids.is_empty() {
        println!("no cameras available");
        return Ok(());
    }
    for id in ids {
        let device = provider.get_device(&id)?;
        println!(
            "{}  {}  {} configurations",
            id,
            device.card(),
            device.characteristics().stream_configs().len()
        );
    }
    Ok(())
}

fn run_dump(args: Vec<String>) -> Result<()> {
    let (provider, free) = setup(args)?;
    let id = free
        .first()
        .with_context(|| "dump needs a CAMERA_ID argument")?;
    let device = provider.get_device(id)?;
    let mut stdout = std::io::stdout();
    device.dump_state(&mut stdout)?;
    Ok(())
}

/// Counts delivered results so the capture command can wait for completion.
#[derive(Default)]
struct PrintingSink {
    finished: Mutex<u64>,
    cond: Condvar,
}

impl PrintingSink {
    fn wait_finished(&self, expected: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut finished = self.finished.lock().unwrap();
        while *finished < expected {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(finished, deadline - now).unwrap();
            finished = guard;
        }
        true
    }

    fn bump(&self, by: u64) {
        *self.finished.lock().unwrap() += by;
        self.cond.notify_all();
    }
}

impl CameraCallback for PrintingSink {
    fn notify(&self, msgs: &[NotifyMsg]) {
        let mut errors = 0;
        for msg in msgs {
            match msg {
                NotifyMsg::Shutter {
                    frame_number,
                    timestamp_ns,
                } => println!("shutter frame {} at {} ns", frame_number, timestamp_ns),
                NotifyMsg::Error {
                    frame_number, code, ..
                } => {
                    println!("error frame {} kind {:?}", frame_number, code);
                    errors += 1;
                }
            }
        }
        if errors > 0 {
            self.bump(errors);
        }
    }

    fn process_capture_result(&self, results: &[CaptureResult]) {
        for result in results {
            println!(
                "result frame {} buffer {} timestamp {} ns",
                result.frame_number,
                result.output_buffers[0].handle.index(),
                result.metadata.sensor_timestamp_ns
            );
        }
        self.bump(results.len() as u64);
    }
}

fn run_capture(args: Vec<String>) -> Result<()> {
    let (provider, free) = setup(args)?;
    let id = free
        .first()
        .with_context(|| "capture needs a CAMERA_ID argument")?;
    let count: u64 = free
        .get(1)
        .with_context(|| "capture needs a COUNT argument")?
        .parse()
        .with_context(|| "COUNT must be a number")?;
    if count == 0 {
        bail!("COUNT must be at least 1");
    }

    let device = provider.get_device(id)?;
    let sink = Arc::new(PrintingSink::default());
    let session = device.open(sink.clone())?;

    // Prefer the smallest flexible 4:2:0 configuration for a quick run.
    let characteristics = device.characteristics();
    let config = characteristics
        .stream_configs()
        .iter()
        .filter(|c| c.format == HalPixelFormat::YCbCr420Flex)
        .min_by_key(|c| c.width * c.height)
        .with_context(|| "camera advertises no flexible 4:2:0 configuration")?;

    let stream = StreamDescriptor {
        stream_id: 0,
        direction: StreamDirection::Output,
        width: config.width,
        height: config.height,
        pixel_format: config.format,
        dataspace: 0,
        usage: 0,
        max_buffers: 4,
    };
    session.configure_streams(&[stream])?;
    println!("capturing {} frames at {}x{}", count, config.width, config.height);

    let settings = session.construct_default_request_settings(RequestTemplate::Preview)?;
    let mut next = 0_u64;
    while next < count {
        let batch: Vec<CaptureRequest> = (next..count.min(next + 4))
            .map(|frame_number| CaptureRequest {
                frame_number,
                output_stream_ids: vec![0],
                settings: settings.clone(),
            })
            .collect();
        let accepted = session.process_capture_request(&batch)?;
        next += u64::from(accepted);
        if accepted == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    if !sink.wait_finished(count, Duration::from_secs(30)) {
        println!("timed out waiting for {} frames", count);
    }
    session.close()?;
    Ok(())
}
