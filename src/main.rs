use anyhow::anyhow;
use pmk::{load, poller::Poller, progress::ConsoleProgress, work};
use std::path::Path;
use std::sync::Arc;

#[derive(argh::FromArgs)]
/// a parallel make-style build driver.
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// build file to read [default=build.pmk]
    #[argh(option, short = 'f', default = "String::from(\"build.pmk\")")]
    file: String,

    /// parallelism [default from system]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// keep building unrelated targets after a failure
    #[argh(switch, short = 'k')]
    keep_going: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// targets to build [default: first target in the build file]
    #[argh(positional)]
    targets: Vec<String>,
}

fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let mut options = work::BuildOptions::default();
    if let Some(jobs) = args.jobs {
        options.parallelism = jobs;
    }
    options.keep_going = args.keep_going;

    let load::BuildFile {
        mut graph,
        default_target,
    } = load::read(&args.file)?;

    let targets = if args.targets.is_empty() {
        vec![default_target]
    } else {
        args.targets
    };

    let poller = Arc::new(Poller::new()?);
    let mut progress = ConsoleProgress::new(args.verbose);
    let mut work = work::Work::new(&mut graph, &mut progress, poller, options);
    work.apply(&targets)?;
    work.run()
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            println!("pmk: error: {}", err);
            2
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
