use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::{fs, io};

use ahash::AHashSet;

use crate::dist::context::Snapshot;
use crate::error::Result;

/// Reads a text file and returns all its lines as a `Vec<String>`.
///
/// - Reads the entire file into memory
/// - Splits on `\n` / `\r\n`
pub fn read_lines<P: AsRef<Path>>(filename: P) -> io::Result<Vec<String>> {
	let mut contents = String::new();
	File::open(filename)?.read_to_string(&mut contents)?;
	Ok(contents.lines().map(str::to_owned).collect())
}

/// Reads a stopword list, one word per line.
///
/// Lines are trimmed and lowercased; empty lines are skipped.
pub fn read_stopwords<P: AsRef<Path>>(filename: P) -> io::Result<AHashSet<String>> {
	Ok(read_lines(filename)?
		.into_iter()
		.map(|line| line.trim().to_lowercase())
		.filter(|word| !word.is_empty())
		.collect())
}

/// Builds an output path based on an input path and a new extension.
///
/// Example:
/// `data/corpus.txt` + `"bin"` → `data/corpus.bin`
pub fn build_output_path<P: AsRef<Path>>(input_path: P, output_extension: &str) -> io::Result<PathBuf> {
	let input_path = input_path.as_ref();

	let parent = input_path.parent().unwrap_or_else(|| Path::new("."));
	let file_stem = input_path
		.file_stem()
		.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Input path has no filename"))?;

	let mut output = PathBuf::from(parent);
	output.push(file_stem);
	output.set_extension(output_extension);

	Ok(output)
}

/// Serializes a snapshot with `postcard` and writes it to `path`.
pub fn write_snapshot<P: AsRef<Path>>(path: P, snapshot: &Snapshot) -> Result<()> {
	let bytes = postcard::to_stdvec(snapshot)?;
	fs::write(path, bytes)?;
	Ok(())
}

/// Reads a snapshot written by `write_snapshot`.
pub fn read_snapshot<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
	let bytes = fs::read(path)?;
	Ok(postcard::from_bytes(&bytes)?)
}
