use std::{error::Error, fs::File, io, sync::Arc};

use clap::Parser;
use extsort::prelude::*;

/// Sort a CSV file with a bounded amount of memory.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Input CSV file
    #[clap(short, long, value_parser)]
    input: String,

    /// Output CSV file; stdout when omitted
    #[clap(short, long, value_parser)]
    output: Option<String>,

    /// Column types, e.g. "int,string?,float" (a trailing '?' marks a
    /// nullable column)
    #[clap(short, long, value_parser)]
    types: String,

    /// Sort keys, e.g. "0,2:desc,1:asc:nulls_low"
    #[clap(short, long, value_parser)]
    keys: String,

    /// Input has a header row (copied to the output)
    #[clap(long)]
    header: bool,

    /// Keep one row per key
    #[clap(long)]
    distinct: bool,

    /// Rows held in memory before spilling; overrides EXTSORT_SORT_BUFFER_MAX
    #[clap(long, value_parser)]
    buffer: Option<usize>,

    /// Maximum runs merged in one pass; overrides EXTSORT_MAX_MERGE_RUNS
    #[clap(long, value_parser)]
    fan_in: Option<usize>,

    /// Directory for spill files; the system temp dir when omitted
    #[clap(long, value_parser)]
    spill_dir: Option<String>,
}

fn parse_template(types: &str) -> Result<RowTemplate, Box<dyn Error>> {
    let mut columns = Vec::new();
    for (i, t) in types.split(',').enumerate() {
        let t = t.trim();
        let (t, nullable) = match t.strip_suffix('?') {
            Some(t) => (t, true),
            None => (t, false),
        };
        let data_type: DataType = t.parse()?;
        columns.push(ColumnDef::new(&format!("c{}", i), data_type, nullable));
    }
    Ok(RowTemplate::new(columns))
}

fn parse_keys(keys: &str) -> Result<Vec<ColumnOrdering>, Box<dyn Error>> {
    let mut orderings = Vec::new();
    for key in keys.split(',') {
        let mut parts = key.trim().split(':');
        let column: usize = parts.next().unwrap_or_default().parse()?;
        let mut ordering = ColumnOrdering::asc(column);
        for flag in parts {
            match flag {
                "asc" => ordering.ascending = true,
                "desc" => ordering.ascending = false,
                "nulls_low" => ordering.nulls_low = true,
                "nulls_high" => ordering.nulls_low = false,
                other => return Err(format!("unknown key flag: {}", other).into()),
            }
        }
        orderings.push(ordering);
    }
    Ok(orderings)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let template = Arc::new(parse_template(&args.types)?);
    let order = SortOrder::new(parse_keys(&args.keys)?);

    let mut config = SortConfig::from_env()?;
    if let Some(buffer) = args.buffer {
        config.buffer_capacity = Some(buffer);
    }
    if let Some(fan_in) = args.fan_in {
        config.max_fan_in = fan_in;
    }

    let store = match &args.spill_dir {
        Some(dir) => FileRunStore::new_in(dir)?,
        None => FileRunStore::new()?,
    };
    let observer: Box<dyn SortObserver> = if args.distinct {
        Box::new(DuplicateEliminator)
    } else {
        Box::new(KeepAll)
    };

    let mut sort = ExternalSort::new(Arc::new(store));
    sort.initialize(order, template.clone(), observer, config)?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(args.header)
        .from_path(&args.input)?;
    let header = if args.header {
        Some(reader.headers()?.clone())
    } else {
        None
    };

    let mut inserter = sort.open();
    for record in reader.records() {
        let record = record?;
        let mut tuple = Tuple::with_capacity(template.arity());
        for (i, value) in record.iter().enumerate() {
            if i >= template.arity() {
                return Err(format!("row has more than {} columns", template.arity()).into());
            }
            tuple.push(Field::from_str(template.get_column(i), value)?);
        }
        inserter.insert(tuple)?;
    }
    inserter.close();

    let out: Box<dyn io::Write> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let mut writer = csv::Writer::from_writer(out);
    if let Some(header) = header {
        writer.write_record(&header)?;
    }
    for row in sort.open_scan()? {
        let row = row?;
        writer.write_record(row.fields().iter().map(|f| f.to_string()))?;
    }
    writer.flush()?;

    eprintln!("{}", sort.info());
    Ok(())
}
