use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use seqstore::{
    clock::{format_micros, now_micros},
    config::{DEFAULT_ORPHAN_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_TOUCH_PERIOD},
    segment::file_version_string,
    ChangeReader, Liveness, OverrunPolicy, PollPolicy, RecordBatch, Result, Segment, SegmentConfig, StoreError,
    Toucher,
};
use std::{str::FromStr, sync::Arc, time::Duration};

fn main() {
    env_logger::init();

    let name_arg = || {
        Arg::with_name("name")
            .value_name("NAME")
            .help("Segment name (shm:NAME or a file path)")
            .required(true)
            .index(1)
    };

    let matches = App::new("seqstore-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Seqstore shared-memory record store tool")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("create")
                .about("Create (or replace) a segment")
                .arg(name_arg())
                .arg(
                    Arg::with_name("max_id")
                        .short("m")
                        .long("max-id")
                        .value_name("ID")
                        .help("Exclusive upper bound of record ids")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("value_size")
                        .short("s")
                        .long("value-size")
                        .value_name("BYTES")
                        .help("Size of each record value")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("base_id")
                        .short("b")
                        .long("base-id")
                        .value_name("ID")
                        .help("Lowest record id")
                        .default_value("0")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("queue_capacity")
                        .short("q")
                        .long("queue-capacity")
                        .value_name("ENTRIES")
                        .help("Change queue capacity (must be power of 2)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("description")
                        .short("d")
                        .long("description")
                        .value_name("TEXT")
                        .help("Segment description, e.g. the feed name")
                        .default_value("")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("inspect")
                .about("Show the segment header")
                .arg(name_arg())
                .arg(Arg::with_name("json").long("json").help("Print as JSON"))
                .arg(
                    Arg::with_name("used")
                        .short("u")
                        .long("used")
                        .help("List ids that have been written"),
                ),
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Hex dump records")
                .arg(name_arg())
                .arg(
                    Arg::with_name("ids")
                        .value_name("ID")
                        .help("Record ids")
                        .required(true)
                        .multiple(true)
                        .index(2),
                ),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write one record from a hex string (refused while another writer is alive)")
                .arg(name_arg())
                .arg(Arg::with_name("id").value_name("ID").required(true).index(2))
                .arg(Arg::with_name("hex").value_name("HEX").required(true).index(3)),
        )
        .subcommand(
            SubCommand::with_name("erase")
                .about("Clear records back to unwritten")
                .arg(name_arg())
                .arg(
                    Arg::with_name("ids")
                        .value_name("ID")
                        .required(true)
                        .multiple(true)
                        .index(2),
                ),
        )
        .subcommand(
            SubCommand::with_name("tail")
                .about("Follow the change queue")
                .arg(name_arg())
                .arg(
                    Arg::with_name("orphan_timeout")
                        .short("o")
                        .long("orphan-timeout")
                        .value_name("SECS")
                        .help("Exit when the writer has not touched for this long (0 disables)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("ignore_overrun")
                        .long("ignore-overrun")
                        .help("Keep going after falling behind the queue"),
                )
                .arg(
                    Arg::with_name("count")
                        .short("c")
                        .long("count")
                        .value_name("N")
                        .help("Exit after N records")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("touch")
                .about("Keep a segment's liveness stamp fresh")
                .arg(name_arg())
                .arg(
                    Arg::with_name("seconds")
                        .short("t")
                        .long("seconds")
                        .value_name("SECS")
                        .help("How long to keep touching")
                        .default_value("10")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("Unlink a segment")
                .arg(name_arg()),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("create", Some(m)) => handle_create(m),
        ("inspect", Some(m)) => handle_inspect(m),
        ("read", Some(m)) => handle_read(m),
        ("write", Some(m)) => handle_write(m),
        ("erase", Some(m)) => handle_erase(m),
        ("tail", Some(m)) => handle_tail(m),
        ("touch", Some(m)) => handle_touch(m),
        ("delete", Some(m)) => handle_delete(m),
        _ => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("error ({}): {}", e.code().name(), e);
        std::process::exit(1);
    }
}

fn required<'a>(matches: &'a ArgMatches, arg: &str) -> Result<&'a str> {
    matches
        .value_of(arg)
        .ok_or_else(|| StoreError::invalid_argument(arg, "missing value"))
}

fn parse<T: FromStr>(arg: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StoreError::invalid_argument(arg, format!("Invalid value '{}'", value)))
}

fn parse_secs(arg: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse(arg, value)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(StoreError::invalid_argument(arg, format!("Invalid duration '{}'", value)));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_ids(matches: &ArgMatches) -> Result<Vec<i64>> {
    matches
        .values_of("ids")
        .into_iter()
        .flatten()
        .map(|id| parse("id", id))
        .collect()
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim_start_matches("0x").as_bytes();
    if hex.len() % 2 != 0 {
        return Err(StoreError::invalid_argument("hex", "odd number of hex digits"));
    }
    let digit = |b: u8| (b as char).to_digit(16).map(|d| d as u8);
    hex.chunks(2)
        .enumerate()
        .map(|(i, pair)| match (digit(pair[0]), digit(pair[1])) {
            (Some(high), Some(low)) => Ok(high << 4 | low),
            _ => Err(StoreError::invalid_argument("hex", format!("bad hex digits at {}", i * 2))),
        })
        .collect()
}

fn print_record(id: i64, revision: i64, timestamp: i64, value: &[u8]) {
    println!("id {} rev {} time {}", id, revision, format_micros(timestamp));
    for (line, chunk) in value.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("  {:04x}  {:<47}  {}", line * 16, hex.join(" "), ascii);
    }
}

fn handle_create(matches: &ArgMatches) -> Result<()> {
    let name = required(matches, "name")?;
    let base_id: i64 = parse("base_id", required(matches, "base_id")?)?;
    let max_id: i64 = parse("max_id", required(matches, "max_id")?)?;
    let value_size: usize = parse("value_size", required(matches, "value_size")?)?;
    let queue_capacity = match matches.value_of("queue_capacity") {
        Some(value) => parse("queue_capacity", value)?,
        None => DEFAULT_QUEUE_CAPACITY,
    };

    let config = SegmentConfig::new(name, max_id, value_size)
        .with_base_id(base_id)
        .with_queue_capacity(queue_capacity)
        .with_description(matches.value_of("description").unwrap_or_default());

    let segment = Segment::create(config)?;
    println!(
        "Created segment '{}': ids [{}, {}), {} byte values, queue {}, {} bytes",
        segment.name(),
        segment.base_id(),
        segment.max_id(),
        segment.value_size(),
        segment.queue_capacity(),
        segment.segment_size()
    );
    Ok(())
}

fn handle_inspect(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::open(required(matches, "name")?)?;
    let info = segment.info();

    if matches.is_present("json") {
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| StoreError::invalid_argument("json", e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    println!("Segment:      {}", info.name);
    println!("Description:  {}", info.description);
    println!("File version: {} (tool {})", info.file_version, file_version_string());
    println!("Data version: {}", info.data_version);
    println!("Ids:          [{}, {})", info.geometry.base_id, info.geometry.max_id);
    println!(
        "Records:      {} x {} bytes (value {} bytes)",
        info.geometry.record_count(),
        info.geometry.record_size,
        info.geometry.value_size
    );
    println!("Queue:        capacity {}, head {}", info.geometry.queue_capacity, info.queue_head);
    println!("Size:         {} bytes", info.geometry.segment_size);
    println!(
        "Owner:        pid {} ({})",
        info.owner_pid,
        if info.owner_alive { "alive" } else { "dead" }
    );
    println!("Created:      {}", format_micros(info.created_micros));
    println!("Last touch:   {}", format_micros(info.last_touched_micros));

    if matches.is_present("used") {
        let used: Vec<String> = segment.used_ids().map(|id| id.to_string()).collect();
        println!("Used ids:     {}", used.join(" "));
    }
    Ok(())
}

fn handle_read(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::open(required(matches, "name")?)?;
    let mut value = vec![0u8; segment.value_size()];

    for id in parse_ids(matches)? {
        match segment.read_record(id, &mut value) {
            Ok(read) => print_record(id, read.revision, read.timestamp, &value),
            Err(StoreError::RecordNotFound { .. }) => println!("id {} unwritten", id),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn handle_write(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::open_writable(required(matches, "name")?)?;
    let id: i64 = parse("id", required(matches, "id")?)?;

    let mut value = decode_hex(required(matches, "hex")?)?;
    if value.len() > segment.value_size() {
        return Err(StoreError::short_buffer(segment.value_size(), value.len()));
    }
    value.resize(segment.value_size(), 0);

    let revision = segment.write_record(id, &value)?;
    println!("Wrote id {} at revision {}", id, revision);
    Ok(())
}

fn handle_erase(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::open_writable(required(matches, "name")?)?;
    for id in parse_ids(matches)? {
        segment.clear_record(id)?;
        println!("Cleared id {}", id);
    }
    Ok(())
}

fn handle_tail(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::open(required(matches, "name")?)?;
    let orphan_timeout = match matches.value_of("orphan_timeout") {
        Some(secs) => parse_secs("orphan_timeout", secs)?,
        None => DEFAULT_ORPHAN_TIMEOUT,
    };
    let limit: Option<u64> = matches.value_of("count").map(|n| parse("count", n)).transpose()?;
    let on_overrun = if matches.is_present("ignore_overrun") {
        OverrunPolicy::Resync
    } else {
        OverrunPolicy::Fail
    };

    let mut reader = ChangeReader::new(&segment)
        .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 1000, Some(Duration::from_millis(250))))
        .with_overrun_policy(on_overrun);
    let mut batch = RecordBatch::for_segment(&segment);
    let mut seen = 0u64;

    loop {
        let read = reader.poll(&mut batch, 0)?;
        for record in batch.iter() {
            print_record(record.id, record.revision, record.timestamp, record.value);
            seen += 1;
            if limit.is_some_and(|limit| seen >= limit) {
                break;
            }
        }
        if limit.is_some_and(|limit| seen >= limit) {
            break;
        }

        if read == 0 && !orphan_timeout.is_zero() {
            match Liveness::probe(&segment, orphan_timeout, now_micros())? {
                Liveness::Alive => {}
                Liveness::Stale { last_touch } => {
                    eprintln!("writer stopped touching at {}", format_micros(last_touch));
                    break;
                }
                Liveness::Dead { pid } => {
                    eprintln!("writer pid {} is gone", pid);
                    break;
                }
            }
        }
    }

    let stats = *reader.next_stats();
    eprintln!(
        "{} records, {} lost; queue latency us: min {:.0} mean {:.1} max {:.0} stddev {:.1}",
        seen,
        reader.lost(),
        stats.min(),
        stats.mean(),
        stats.max(),
        stats.stddev()
    );
    Ok(())
}

fn handle_touch(matches: &ArgMatches) -> Result<()> {
    let name = required(matches, "name")?;
    let duration = parse_secs("seconds", required(matches, "seconds")?)?;

    let segment = Arc::new(Segment::open_writable(name)?);
    let toucher = Toucher::spawn(DEFAULT_TOUCH_PERIOD)?;
    toucher.add(Arc::clone(&segment))?;

    println!("Touching '{}' for {:?}", name, duration);
    std::thread::sleep(duration);
    toucher.stop()?;

    println!("Last touch: {}", format_micros(segment.touched_time()?));
    Ok(())
}

fn handle_delete(matches: &ArgMatches) -> Result<()> {
    let name = required(matches, "name")?;
    if Segment::delete(name)? {
        println!("Deleted segment '{}'", name);
    } else {
        println!("Segment '{}' does not exist", name);
    }
    Ok(())
}
