use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// A class label and the color its boxes are drawn with.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorLabel {
    pub label: String,
    pub color: [u8; 3],
}

/// Reads a labels file with one `label,red,green,blue` entry per line, in
/// class-id order. Blank lines are skipped.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<ColorLabel>> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

fn parse_labels(reader: impl BufRead) -> io::Result<Vec<ColorLabel>> {
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();

        if parts.len() != 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }

        let channel = |value: &str, name: &str| {
            value.trim().parse::<u8>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, format!("Invalid {} value", name))
            })
        };

        labels.push(ColorLabel {
            label: parts[0].trim().to_string(),
            color: [
                channel(parts[1], "red")?,
                channel(parts[2], "green")?,
                channel(parts[3], "blue")?,
            ],
        });
    }

    Ok(labels)
}
