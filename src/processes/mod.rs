use core::fmt;

pub mod process;
pub mod scheduler;
pub mod table;

use process::ProcessInfo;

/// Renders the table shown by the `ps` command.
pub fn write_process_list<W: fmt::Write>(
    out: &mut W,
    processes: impl IntoIterator<Item = ProcessInfo>,
) -> fmt::Result {
    writeln!(out, "Process List:")?;
    writeln!(out, "PID  Name           State    Priority  CPU Time")?;
    writeln!(out, "---  ----           -----    --------  --------")?;
    for p in processes {
        writeln!(
            out,
            "{:<3}  {:<13}  {:<7}  {:<8}  {}",
            p.pid.as_u32(),
            p.name.as_str(),
            p.state,
            p.priority,
            p.total_ticks
        )?;
    }
    Ok(())
}
