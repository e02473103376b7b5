//! Executable for inspecting the FTW Lite work space of a flash image.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use clap::Parser;
use patina_ftw_lite::parser::WorkSpaceParser;
use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

#[derive(Parser, Debug)]
struct Args {
    /// Path for the input file containing a raw flash image.
    input_path: PathBuf,
    /// Byte offset of the work space header in the image. Searched for by signature if not specified.
    #[arg(long, value_parser = parse_offset)]
    offset: Option<usize>,
    /// Optional path for the output file. If not specified, the output will be printed to stdout.
    #[arg(short, long)]
    output_path: Option<PathBuf>,
}

fn parse_offset(value: &str) -> Result<usize, String> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|e| e.to_string())
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    // Open the input file
    let mut file = File::open(Path::new(&args.input_path))?;

    // Read the file contents into a buffer
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    let offset = match args.offset.or_else(|| WorkSpaceParser::find(&buffer)) {
        Some(offset) if offset < buffer.len() => offset,
        _ => return Err(dump_error("No work space found.")),
    };
    let parser = WorkSpaceParser::open(&buffer[offset..]).map_err(dump_error)?;

    // Write to standard if no output file is specified.
    match args.output_path {
        Some(path) => {
            let mut out = File::create(path)?;
            parser.write_summary(&mut out).map_err(dump_error)?;
        }
        None => parser.write_summary(&mut io::stdout()).map_err(dump_error)?,
    };

    Ok(())
}

fn dump_error(e: &'static str) -> io::Error {
    eprintln!("Error dumping work space: {}", e);
    io::Error::other(e)
}
