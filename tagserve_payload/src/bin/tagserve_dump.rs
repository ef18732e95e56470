//! Draw tag request metrics from a traffic model and write them to stdout, one
//! JSON message per line, then exit.

use std::{
    io::{BufWriter, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use rand::{SeedableRng, rngs::SmallRng};
use tagserve_payload::{Error, ModelSource, SampleGenerator, TagRequest, generator};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the traffic model
    model_path: PathBuf,
    /// Number of messages to write
    #[clap(long, default_value_t = 10)]
    count: u64,
    /// Seed for the random number generator
    #[clap(long, default_value_t = 19_690_616)]
    seed: u64,
}

fn run(args: Args) -> Result<(), Error> {
    let generator = SampleGenerator::load(
        &ModelSource::Path(args.model_path),
        generator::DEFAULT_WINDOW_MILLIS,
    )?;
    let payload = TagRequest::new(Arc::new(generator));
    let mut rng = SmallRng::seed_from_u64(args.seed);

    // NOTE we lock stdout and wrap it in a buffered writer to avoid needing to
    // reacquire the stdio lock each write.
    let stdout = std::io::stdout();
    let mut fp = BufWriter::with_capacity(1_000_000, stdout.lock());
    for _ in 0..args.count {
        let message = payload.next_message(&mut rng)?;
        fp.write_all(&message)?;
        fp.write_all(b"\n")?;
    }
    fp.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
