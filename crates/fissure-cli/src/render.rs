//! Text renderings of a cracked model.

use fissure_core::model::{ElementId, Model, Realized};
use fissure_core::{CrackEvent, PositionTable};

/// Longest value preview, in bytes
const PREVIEW_BYTES: usize = 16;

/// Indented element tree with bit ranges and value previews
pub fn tree(model: &Model, positions: &PositionTable) -> String {
    let mut out = String::new();
    let mut stack = vec![(model.root(), 0usize)];

    while let Some((id, depth)) = stack.pop() {
        let element = &model[id];
        out.push_str(&"  ".repeat(depth));
        out.push_str(&format!("{} {}", element.name(), element.kind().label()));

        match positions.get(id) {
            Some(position) => {
                let end = position
                    .end
                    .map_or_else(|| "?".to_string(), |end| end.to_string());
                out.push_str(&format!(" [{}..{}]", position.begin, end));
            }
            None => out.push_str(" [not cracked]"),
        }

        if let Some(value) = element.value() {
            out.push_str(&format!(" = {}", preview(value)));
        }
        out.push('\n');

        for child in element.children().iter().rev() {
            stack.push((*child, depth + 1));
        }
    }

    out
}

/// One line per recorded notification
pub fn events(model: &Model, events: &[CrackEvent]) -> String {
    let mut out = String::new();

    for event in events {
        let line = match event {
            CrackEvent::Entered { element, position } => {
                format!("entered {} @{}", model.full_name(*element), position.begin)
            }
            CrackEvent::Exited { element, position } => format!(
                "exited {} @{}..{}",
                model.full_name(*element),
                position.begin,
                position.end.unwrap_or(position.begin)
            ),
            CrackEvent::Failed {
                element,
                bit_position,
                error,
            } => format!(
                "failed {} @{}: {}",
                model.full_name(*element),
                bit_position,
                error
            ),
            CrackEvent::Placed {
                old_name, new_name, ..
            } => format!("placed {} -> {}", old_name, new_name),
        };
        out.push_str(&line);
        out.push('\n');
    }

    out
}

/// Tab separated `name begin end size` rows, in the order elements were entered
pub fn positions(model: &Model, positions: &PositionTable) -> String {
    let mut out = String::new();

    for (id, position) in positions.iter() {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            name_of(model, id),
            position.begin,
            field(position.end),
            field(position.size)
        ));
    }

    out
}

fn name_of(model: &Model, id: ElementId) -> String {
    if model.is_attached(id) {
        model.full_name(id)
    } else {
        format!("{} (detached)", model[id].name())
    }
}

fn field(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Hex bytes, followed by the text when it is printable ASCII
fn preview(value: &Realized) -> String {
    let shown = &value.data[..value.data.len().min(PREVIEW_BYTES)];
    let mut out: String = shown.iter().map(|b| format!("{:02x}", b)).collect();
    if value.data.len() > PREVIEW_BYTES {
        out.push_str("..");
    }

    if !shown.is_empty() && shown.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        out.push_str(&format!(" {:?}", String::from_utf8_lossy(shown)));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fissure_core::{BitStream, Cracker, ElementSpec, EventLog};
    use pretty_assertions::assert_eq;

    fn cracked() -> (Model, Cracker, EventLog) {
        let spec = ElementSpec::block("Line")
            .child(ElementSpec::blob("text"))
            .child(ElementSpec::blob("eol").token(&b"\r\n"[..]));
        let mut model = Model::build(spec).unwrap();
        let root = model.root();
        let mut cracker = Cracker::new();
        let mut log = EventLog::new();
        let mut stream = BitStream::new(b"AB\r\n");
        cracker
            .crack_with(&mut model, root, &mut stream, &mut log)
            .unwrap();
        (model, cracker, log)
    }

    #[test]
    fn test_tree() {
        let (model, cracker, _) = cracked();
        assert_eq!(
            tree(&model, cracker.positions()),
            "Line block [0..32]\n  text blob [0..16] = 4142 \"AB\"\n  eol blob [16..32] = 0d0a\n"
        );
    }

    #[test]
    fn test_positions() {
        let (model, cracker, _) = cracked();
        let rendered = positions(&model, cracker.positions());
        let rows: Vec<&str> = rendered.lines().collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], "Line\t0\t32\t-");
        assert_eq!(rows[1], "Line.text\t0\t16\t16");
    }

    #[test]
    fn test_events() {
        let (model, _, log) = cracked();
        let rendered = events(&model, log.events());
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.first(), Some(&"entered Line @0"));
        assert_eq!(lines.last(), Some(&"exited Line @0..32"));
    }

    #[test]
    fn test_preview_truncates() {
        let value = Realized::from_bytes(vec![0u8; 20]);
        let shown = preview(&value);
        assert!(shown.ends_with(".."));
        assert_eq!(shown.len(), PREVIEW_BYTES * 2 + 2);
    }
}
