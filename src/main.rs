use args::Args;
use getopts::Occur;
use glob::glob;
use memtrack::Snapshot;
use std::fs;

const PROGRAM_DESC: &str = "Aggregate and print memtrack allocation reports";
const PROGRAM_NAME: &str = "mt_print";

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores dumped reports",
        "DIR",
        Occur::Req,
        None,
    );

    args.parse_from_cli()?;

    let dir: String = args.value_of("dir")?;
    let wildcard = format!("{}/memtrack.*", dir);

    let mut snapshots = vec![];

    for path in glob(wildcard.as_str())? {
        let path = path?;
        eprintln!("found report in {}", path.display());
        let snapshot_bytes = fs::read(path)?;
        snapshots.push(serde_yaml::from_slice::<Snapshot>(&snapshot_bytes[..])?);
    }

    // Aggregate per-process reports.
    let mut aggregate = Snapshot::new();

    for snapshot in snapshots.iter() {
        aggregate.merge(snapshot);
    }

    println!("{}", aggregate);

    Ok(())
}
