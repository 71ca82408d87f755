//! Status command: store location, last tick per job, leaked links.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use club_db::Database;

use crate::scheduler::Job;

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path) -> Result<()> {
    let members = db.all_member_ids()?.len();

    writeln!(writer, "Club status")?;
    writeln!(writer, "Database: {}", database_path.display())?;
    writeln!(writer, "Members: {members}")?;

    writeln!(writer, "Last ticks:")?;
    for job in Job::ALL {
        match db.last_tick(job.name())? {
            Some(instant) => writeln!(writer, "- {job}: {}", instant.to_rfc3339())?,
            None => writeln!(writer, "- {job}: never")?,
        }
    }

    let leaked = db.leaked_tokens()?;
    if leaked.is_empty() {
        writeln!(writer, "No leaked links.")?;
        return Ok(());
    }
    writeln!(writer, "Leaked links (revoke by hand):")?;
    for token in leaked {
        writeln!(
            writer,
            "- member {} {}: {} ({})",
            token.member_id, token.channel, token.link, token.error
        )?;
    }
    Ok(())
}
