//! Human-readable rendering of [`DerivedMetrics`].
use crate::diff::DerivedMetrics;
use std::io::{self, Write};
use std::time::Duration;

const RULE: &str = "-------------------------------------------------------------------------";

/// Format `value` with `precision` decimals and `,` between thousands.
pub fn group_thousands(value: f64, precision: usize) -> String {
    let formatted = format!("{:.*}", precision, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value.is_sign_negative() && formatted.bytes().any(|b| b != b'0' && b != b'.') {
        "-"
    } else {
        ""
    };
    match frac_part {
        Some(frac) => format!("{sign}{grouped}.{frac}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Write the per-module table and the aggregate amplification lines.
/// The elapsed-time header line is left out when `elapsed` is `None`.
pub fn write_report<W: Write + ?Sized>(
    out: &mut W,
    name: &str,
    elapsed: Option<Duration>,
    metrics: &DerivedMetrics,
) -> io::Result<()> {
    writeln!(out, "{RULE}")?;
    match elapsed {
        Some(elapsed) => writeln!(
            out,
            "{name}: elapsed time: {} sec",
            group_thousands(elapsed.as_secs_f64(), 2)
        )?,
        None => writeln!(out, "{name}")?,
    }
    writeln!(out, "{RULE}")?;
    writeln!(
        out,
        "|DIMM\t|RA\t|WA\t|iMC Rd(MB)\t|Media Rd(MB)\t|iMC Wr(MB)\t|Media Wr(MB)\t|"
    )?;
    for m in &metrics.modules {
        writeln!(
            out,
            "|{}\t|{}\t|{}\t|{:>8}\t|{:>8}\t|{:>8}\t|{:>8}\t|",
            m.id,
            m.read_amplification,
            m.write_amplification,
            group_thousands(m.controller_read_mb, 2),
            group_thousands(m.media_read_mb, 2),
            group_thousands(m.controller_write_mb, 2),
            group_thousands(m.media_write_mb, 2),
        )?;
    }

    let t = &metrics.total;
    writeln!(
        out,
        "Total RA: {}, iMC read {}MB, media read {}MB",
        t.read_amplification,
        group_thousands(t.controller_read_mb, 2),
        group_thousands(t.media_read_mb, 2),
    )?;
    writeln!(
        out,
        "Total WA: {}, iMC write {}MB, media write {}MB",
        t.write_amplification,
        group_thousands(t.controller_write_mb, 2),
        group_thousands(t.media_write_mb, 2),
    )?;
    out.flush()
}
