use rocksdb::{IteratorMode, Options, DB};
use rustysync::config::{get_db_path, load_config};
use rustysync::constants::{CF_FILE_PROGRESS, COLUMN_FAMILIES};
use rustysync::types::{decode_file_progress, BoxedError};

fn main() -> Result<(), BoxedError> {
    let config = load_config()?;
    let db_path = get_db_path(&config)?;

    let mut cf_names = vec!["default"];
    cf_names.extend(COLUMN_FAMILIES);

    let opts = Options::default();
    let db = DB::open_cf_for_read_only(&opts, db_path, &cf_names, false)?;

    println!("=== ROW COUNTS ===");
    for cf_name in COLUMN_FAMILIES {
        let cf = db.cf_handle(cf_name).ok_or("CF not found")?;
        let count = db.iterator_cf(cf, IteratorMode::Start).count();
        println!("{:<16} {}", cf_name, count);
    }

    println!("\n=== FILE PROGRESS ===");
    let cf = db.cf_handle(CF_FILE_PROGRESS).ok_or("CF not found")?;
    let mut any = false;
    for result in db.iterator_cf(cf, IteratorMode::Start) {
        let (key, value) = result?;
        if key.len() != 4 {
            continue;
        }
        let file_number = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        let best = decode_file_progress(Some(value.to_vec()));
        println!("blk{:05}.dat  best_height={}", file_number, best);
        any = true;
    }
    if !any {
        println!("(no files indexed)");
    }

    Ok(())
}
