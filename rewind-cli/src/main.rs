use std::{
    fs,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    process,
};

use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Sender};
use serde::Serialize;

use rewind_core::{
    cache::CacheConfig,
    error::Error,
    fetch::{FileFetcher, HttpFetcher, RangeFetcher},
    format::BagWriter,
    player::{
        Phase, PlaybackConfig, Player, PlayerListener, PlayerState, PreloadPolicy, Presence,
        Subscriptions,
    },
    source::{BagSource, MessageSource, Progress},
    time::Timestamp,
};
use url::Url;

#[derive(Parser)]
#[command(name = "rewind", about = "Stream and play back remote recordings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the time range and topics of a recording.
    Info {
        /// Path or http(s) URL of the recording.
        source: String,
    },
    /// Play a recording, printing every state change.
    Play {
        /// Path or http(s) URL of the recording.
        source: String,
        /// Topic to subscribe to; may repeat.  Defaults to every topic.
        #[arg(long = "topic")]
        topics: Vec<String>,
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        /// Seek to this many seconds into the recording before playing.
        #[arg(long)]
        seek: Option<f64>,
        /// Emit states as JSON lines instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
    /// Generate a synthetic recording, handy for demos and dev servers.
    Record {
        out: PathBuf,
        #[arg(long, default_value_t = 3)]
        topics: u32,
        #[arg(long, default_value_t = 1000)]
        messages: u32,
        /// Length of the generated timeline in seconds.
        #[arg(long, default_value_t = 60)]
        seconds: u32,
    },
    /// Serve a local recording over ranged HTTP for development.
    Serve {
        file: PathBuf,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli.command) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Info { source } => info(&source),
        Command::Play {
            source,
            topics,
            speed,
            seek,
            json,
        } => play(&source, topics, speed, seek, json),
        Command::Record {
            out,
            topics,
            messages,
            seconds,
        } => record(&out, topics, messages, seconds),
        Command::Serve { file, port } => serve(&file, port),
    }
}

fn open_source(location: &str) -> Result<BagSource, Error> {
    let fetcher: Box<dyn RangeFetcher> =
        if location.starts_with("http://") || location.starts_with("https://") {
            let url = Url::parse(location)
                .map_err(|err| Error::InvalidArg(format!("bad URL {location}: {err}")))?;
            Box::new(HttpFetcher::new(url))
        } else {
            Box::new(FileFetcher::new(location))
        };
    Ok(BagSource::new(fetcher, CacheConfig::default()))
}

fn info(location: &str) -> Result<(), Error> {
    let mut source = open_source(location)?;
    let info = source.initialize()?;
    let length = info.end.nanos_since(info.start) as f64 / 1e9;
    println!("{location}");
    println!("  range: {} .. {} ({length:.3}s)", fmt_time(info.start), fmt_time(info.end));
    println!("  topics:");
    for topic in &info.topics {
        println!("    {} ({})", topic.name, topic.schema);
    }
    source.terminate();
    Ok(())
}

struct ForwardListener(Sender<PlayerState>);

impl PlayerListener for ForwardListener {
    fn on_state(&mut self, state: PlayerState) -> Result<(), Error> {
        self.0.send(state).map_err(Error::from)
    }
}

fn play(
    location: &str,
    topics: Vec<String>,
    speed: f64,
    seek: Option<f64>,
    json: bool,
) -> Result<(), Error> {
    let mut source = open_source(location)?;
    // Ride out network flakes instead of failing the playback.
    source.cache().set_reconnect_callback(Box::new(|reconnecting| {
        if reconnecting {
            log::warn!("connection lost, reconnecting");
        } else {
            log::info!("connection recovered");
        }
    }));
    let recording = source.initialize()?;

    let subscriptions: Subscriptions = if topics.is_empty() {
        recording
            .topics
            .iter()
            .map(|t| (t.name.clone(), PreloadPolicy::Full))
            .collect()
    } else {
        topics
            .into_iter()
            .map(|name| (name, PreloadPolicy::Full))
            .collect()
    };

    let player = Player::spawn(Box::new(source), PlaybackConfig::default());
    let (tx, rx) = unbounded();
    player.set_listener(Box::new(ForwardListener(tx)));
    player.set_subscriptions(subscriptions);
    if let Some(seconds) = seek {
        player.seek(Timestamp::from_total_nanos((seconds * 1e9) as i128));
    }
    player.set_speed(speed);
    player.play();

    let mut was_playing = false;
    for state in rx.iter() {
        if json {
            print_json_state(&state);
        } else {
            print_state(&state);
        }
        if state.presence == Presence::Error {
            break;
        }
        was_playing |= state.is_playing;
        if was_playing && !state.is_playing && state.phase == Phase::Idle {
            break;
        }
    }

    player.close();
    player.join();
    Ok(())
}

fn print_state(state: &PlayerState) {
    println!(
        "[{:?}] t={} presence={:?} playing={} speed={} messages={}",
        state.phase,
        fmt_time(state.current_time),
        state.presence,
        state.is_playing,
        state.speed,
        state.messages.len(),
    );
    for message in &state.messages {
        println!(
            "    {} {} ({} bytes)",
            fmt_time(message.receive_time),
            message.topic,
            message.size_bytes,
        );
    }
}

#[derive(Serialize)]
struct StateLine<'a> {
    phase: Phase,
    presence: Presence,
    current_time: Timestamp,
    start_time: Timestamp,
    end_time: Timestamp,
    is_playing: bool,
    speed: f64,
    messages: Vec<MessageLine<'a>>,
    progress: &'a Progress,
}

#[derive(Serialize)]
struct MessageLine<'a> {
    topic: &'a str,
    receive_time: Timestamp,
    size_bytes: u64,
}

fn print_json_state(state: &PlayerState) {
    let line = StateLine {
        phase: state.phase,
        presence: state.presence,
        current_time: state.current_time,
        start_time: state.start_time,
        end_time: state.end_time,
        is_playing: state.is_playing,
        speed: state.speed,
        messages: state
            .messages
            .iter()
            .map(|m| MessageLine {
                topic: &m.topic,
                receive_time: m.receive_time,
                size_bytes: m.size_bytes,
            })
            .collect(),
        progress: &state.progress,
    };
    match serde_json::to_string(&line) {
        Ok(json) => println!("{json}"),
        Err(err) => log::error!("failed to serialize state: {}", err),
    }
}

fn fmt_time(time: Timestamp) -> String {
    format!("{}.{:09}", time.sec, time.nsec)
}

fn record(out: &Path, topics: u32, messages: u32, seconds: u32) -> Result<(), Error> {
    if topics == 0 {
        return Err(Error::InvalidArg("need at least one topic".into()));
    }
    let file = fs::File::create(out)?;
    let mut writer = BagWriter::new(file)?;
    let ids: Vec<u32> = (0..topics)
        .map(|i| writer.add_topic(&format!("/topic_{i}"), "demo/Sample"))
        .collect::<Result<_, _>>()?;

    let span_nanos = seconds as i64 * 1_000_000_000;
    for i in 0..messages {
        let topic = ids[(i % topics) as usize];
        let time = Timestamp::ZERO.add_nanos(if messages > 1 {
            span_nanos / (messages as i64 - 1).max(1) * i as i64
        } else {
            0
        });
        let payload = format!("/topic_{} #{i}", i % topics);
        writer.write_message(topic, time, payload.as_bytes())?;
    }
    writer.finish()?;
    println!(
        "wrote {} messages on {} topics over {}s to {}",
        messages,
        topics,
        seconds,
        out.display()
    );
    Ok(())
}

fn serve(file: &Path, port: u16) -> Result<(), Error> {
    let size = fs::metadata(file)?.len();
    let etag = format!("\"{}-{}\"", size, file.display());
    let server = tiny_http::Server::http(("0.0.0.0", port))
        .map_err(|err| Error::Network(format!("failed to bind port {port}: {err}")))?;
    println!("serving {} ({} bytes) on http://0.0.0.0:{}/", file.display(), size, port);

    for request in server.incoming_requests() {
        let range = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("Range"))
            .and_then(|h| parse_range(h.value.as_str(), size));

        let response = match range {
            Some((start, end)) => {
                log::debug!("serving {}..{}", start, end);
                match read_slice(file, start, end) {
                    Ok(body) => tiny_http::Response::from_data(body)
                        .with_status_code(206)
                        .with_header(header(
                            "Content-Range",
                            &format!("bytes {}-{}/{}", start, end - 1, size),
                        )),
                    Err(err) => {
                        log::error!("failed to read {}: {}", file.display(), err);
                        tiny_http::Response::from_data(Vec::new()).with_status_code(500)
                    }
                }
            }
            None => match fs::read(file) {
                Ok(body) => tiny_http::Response::from_data(body),
                Err(err) => {
                    log::error!("failed to read {}: {}", file.display(), err);
                    tiny_http::Response::from_data(Vec::new()).with_status_code(500)
                }
            },
        };
        let response = response
            .with_header(header("Accept-Ranges", "bytes"))
            .with_header(header("ETag", &etag));
        if let Err(err) = request.respond(response) {
            log::warn!("failed to respond: {}", err);
        }
    }
    Ok(())
}

fn read_slice(file: &Path, start: u64, end: u64) -> Result<Vec<u8>, Error> {
    let mut handle = fs::File::open(file)?;
    handle.seek(SeekFrom::Start(start))?;
    let mut body = Vec::with_capacity((end - start) as usize);
    handle.take(end - start).read_to_end(&mut body)?;
    Ok(body)
}

fn header(field: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(field.as_bytes(), value.as_bytes())
        .expect("static header is well-formed")
}

/// Parses `bytes=start-end` (inclusive end) into a half-open range clamped
/// to the file size.
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if start >= size {
        return None;
    }
    Some((start, (end + 1).min(size)))
}
