#![deny(clippy::needless_borrow)]

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use tracing_subscriber::EnvFilter;

use jpds::classpath::ClassPath;
use jpds::{Config, WrapMode};

type TerminatingResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn app() -> App<'static, 'static> {
    use clap::*;

    app_from_crate!()
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Logs more; repeat for debug output (RUST_LOG overrides)")
            )
        .subcommand(
            SubCommand::with_name("translate")
                .about("Translates a JVM method and everything it reaches into pushdown-system rules")
                .arg(Arg::with_name("entry")
                        .help("Names the entry method as pkg/Class.method(descriptor)")
                        .required(true)
                    )
                .arg(Arg::with_name("bits")
                        .help("Specifies the integer bit width")
                        .required(true)
                    )
                .arg(Arg::with_name("heap-size")
                        .help("Specifies the number of heap cells")
                        .required(true)
                    )
                .arg(Arg::with_name("search")
                        .help("Adds directories or jars to search for class files")
                        .multiple(true)
                    )
                .arg(Arg::with_name("output")
                        .short("o")
                        .long("output")
                        .help("Specifies the output file name")
                        .takes_value(true)
                    )
                .arg(Arg::with_name("threads")
                        .long("threads")
                        .help("Specifies the number of modeled threads")
                        .takes_value(true)
                    )
                .arg(Arg::with_name("exhaustive")
                        .long("exhaustive")
                        .help("Enumerates every argument value instead of pushing ranges")
                    )
                .arg(Arg::with_name("no-context-switch")
                        .long("no-context-switch")
                        .help("Leaves interleaving points untagged")
                    )
                .arg(Arg::with_name("no-nondet")
                        .long("no-nondet")
                        .help("Keeps Integer.MAX_VALUE and MIN_VALUE constants as written")
                    )
                .arg(Arg::with_name("ignore")
                        .long("ignore")
                        .help("Excludes classes with this name prefix")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                    )
            )
}

fn init_logging(verbosity : u64) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_from(m : &ArgMatches) -> Result<Config, Box<dyn std::error::Error>> {
    let bits = m.value_of("bits").ok_or("expected a bit width")?.parse()?;
    let heap_size = m.value_of("heap-size").ok_or("expected a heap size")?.parse()?;
    let mut config = Config::new(bits, heap_size);
    if let Some(t) = m.value_of("threads") {
        config.thread_bound = t.parse()?;
    }
    if m.is_present("exhaustive") {
        config.mode = WrapMode::Exhaustive;
    }
    config.context_switches = !m.is_present("no-context-switch");
    config.nondet = !m.is_present("no-nondet");
    if let Some(list) = m.values_of("ignore") {
        config.ignored_prefixes.extend(list.map(String::from));
    }
    config.validate()?;
    Ok(config)
}

fn translate_entry(config : &Config, entry : &str, search : &[PathBuf], outfile : &mut dyn Write) -> TerminatingResult {
    let classpath = ClassPath::from_environment(search, Some(config.stub_prefix.clone()))?;
    let program = jpds::translate(config, &classpath, entry)?;
    write!(outfile, "{}", program)?;
    Ok(())
}

#[test]
fn test_arguments() -> TerminatingResult {
    let m = app().get_matches_from_safe(vec![
        "jpds-cli", "translate", "sort/Quicksort.test([I)V", "4", "15", "/tmp/classes",
        "--threads", "2", "--exhaustive", "--ignore", "org/", "--ignore", "com/",
    ])?;
    let m = m.subcommand_matches("translate").ok_or("expected a subcommand")?;
    let config = config_from(m)?;
    assert_eq!((config.bits, config.heap_size, config.thread_bound), (4, 15, 2));
    assert_eq!(config.mode, WrapMode::Exhaustive);
    assert!(config.context_switches);
    assert!(config.is_ignored("org/junit/Test"));
    assert!(config.is_ignored("com/example/A"));
    assert_eq!(m.values_of("search").map(Iterator::count), Some(1));

    assert!(app().get_matches_from_safe(vec![ "jpds-cli", "translate", "A.m(I)I", "4" ]).is_err());

    let m = app().get_matches_from_safe(vec![ "jpds-cli", "translate", "A.m(I)I", "40", "15" ])?;
    let m = m.subcommand_matches("translate").ok_or("expected a subcommand")?;
    assert!(config_from(m).is_err());
    Ok(())
}

#[test]
fn test_translate_file() -> TerminatingResult {
    use jpds::classpath::ClassSource;

    let root = std::path::Path::new(env!("OUT_DIR"));
    let mut config = Config::new(4, 31);
    config.ignored_prefixes = vec![ "java/".into(), "jdk/".into(), "sun/".into() ];
    config.never_ignored.clear();
    config.stubs.clear();
    let classpath = ClassPath::new(vec![ root.to_owned() ], None);

    let is_dir_or_class = |e : &walkdir::DirEntry| {
        e.metadata().map(|e| e.is_dir()).unwrap_or(false) ||
            e.file_name().to_str().map(|s| s.ends_with(".class")).unwrap_or(false)
    };
    for from in walkdir::WalkDir::new(root).into_iter().filter_entry(is_dir_or_class) {
        let from = from?;
        let from = from.path();
        if ! from.metadata()?.is_dir() {
            let name = from.strip_prefix(root)?.with_extension("");
            let name = name.to_str().ok_or("expected Unicode filename")?.replace(std::path::MAIN_SEPARATOR, "/");
            let def = classpath.load(&name)?.ok_or("class vanished")?;
            for m in def.methods.iter().filter(|m| m.is_static && m.name == "test") {
                let entry = format!("{}.{}{}", name, m.name, m.descriptor);
                let mut translated = Vec::new();
                let program = jpds::translate(&config, &classpath, &entry)?;
                write!(&mut translated, "{}", program)?;

                let text = std::str::from_utf8(&translated)?;
                assert!(text.starts_with("bits 4\n"));
                assert!(text.contains(&format!("-> {}0 ", jpds::label::method_name(&name, &m.name, &m.descriptor))));
            }
        }
    }

    Ok(())
}

fn main() -> TerminatingResult {
    let m = app().get_matches();
    init_logging(m.occurrences_of("verbose"));

    if let Some(m) = m.subcommand_matches("translate") {
        let entry = m.value_of("entry").ok_or("expected an entry method")?;
        let config = config_from(m)?;
        let search : Vec<PathBuf> = m.values_of("search").map(|v| v.map(PathBuf::from).collect()).unwrap_or_default();

        match m.value_of("output") {
            Some(path) => {
                let mut outfile = File::create(path)?;
                translate_entry(&config, entry, &search, &mut outfile)?;
                eprintln!("Wrote {} from {}", path, entry);
            },
            None => {
                let stdout = std::io::stdout();
                let mut outfile = stdout.lock();
                translate_entry(&config, entry, &search, &mut outfile)?;
            },
        }
    }

    Ok(())
}
