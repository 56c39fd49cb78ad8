use pillbox_core::Database;

pub fn run(yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !yes {
        return Err("refusing to wipe stored data without --yes".into());
    }
    let db = Database::open()?;
    db.reset_all()?;
    println!("all schedules, records and state wiped");
    Ok(())
}
