// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest Loader (C2): parses the on-disk artifact the resolver locates
//! into a typed [`kiwi_core`] structure, plus any attached auxiliary files.
//!
//! Three artifact shapes are understood: tool manifests (YAML, standalone or
//! embedded as a frontmatter comment block in a script), directive markdown
//! (an XML-enveloped body), and knowledge markdown (YAML frontmatter plus a
//! body). Unknown top-level keys are preserved, never rejected.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use kiwi_core::{CostBudget, Directive, EntryType, KnowledgeEntry, ToolManifest};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;

/// Failures while turning artifact bytes into a typed manifest.
///
/// The three-way split mirrors spec §4.2: malformed syntax, a known field
/// with the wrong shape, and a structurally valid document that violates a
/// semantic invariant (e.g. a primitive declaring a non-null executor).
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("parse error in {artifact}: {reason}")]
    Parse { artifact: String, reason: String },
    #[error("schema error in {artifact}: {reason}")]
    Schema { artifact: String, reason: String },
    #[error("semantic error in {artifact}: {reason}")]
    Semantic { artifact: String, reason: String },
}

/// One attached auxiliary file belonging to a multi-file tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub relative_path: String,
    pub bytes: Vec<u8>,
    pub media_type: String,
}

fn guess_media_type(relative_path: &str) -> String {
    match Path::new(relative_path)
        .extension()
        .and_then(|e| e.to_str())
    {
        Some("py") => "text/x-python",
        Some("sh") => "text/x-shellscript",
        Some("js") => "text/javascript",
        Some("ts") => "text/x-typescript",
        Some("yaml" | "yml") => "application/yaml",
        Some("json") => "application/json",
        Some("md") => "text/markdown",
        _ => "application/octet-stream",
    }
    .to_string()
}

// ---------------------------------------------------------------------------
// Tool manifests
// ---------------------------------------------------------------------------

/// Parse a standalone YAML tool manifest and check its structural invariants.
///
/// # Errors
///
/// Returns [`ManifestError::Parse`] for malformed YAML,
/// [`ManifestError::Schema`] for an invalid `tool_id`, and
/// [`ManifestError::Semantic`] when `tool_type=primitive ⇔ executor=null`
/// does not hold.
pub fn parse_tool_manifest(yaml: &str, artifact: &str) -> Result<ToolManifest, ManifestError> {
    let manifest: ToolManifest =
        serde_yaml::from_str(yaml).map_err(|e| ManifestError::Parse {
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })?;

    if !manifest.has_valid_id() {
        return Err(ManifestError::Schema {
            artifact: artifact.to_string(),
            reason: format!(
                "tool_id {:?} does not match ^[a-z][a-z0-9_]*$",
                manifest.tool_id
            ),
        });
    }

    if !manifest.executor_invariant_holds() {
        return Err(ManifestError::Semantic {
            artifact: artifact.to_string(),
            reason: "tool_type=primitive must imply executor=null, and vice versa".to_string(),
        });
    }

    Ok(manifest)
}

/// The leading comment-block frontmatter marker, one space after `#`.
const FRONTMATTER_START: &str = "# ---";

/// Extract a YAML frontmatter block embedded as a leading comment block in a
/// script file (after an optional shebang line), of the form:
///
/// ```text
/// #!/usr/bin/env python3
/// # ---
/// # tool_id: my_tool
/// # tool_type: script
/// # ---
/// ```
///
/// Returns `(yaml_text, body_after_frontmatter)`, or `None` if no frontmatter
/// block is present.
#[must_use]
pub fn extract_comment_frontmatter(content: &str) -> Option<(String, &str)> {
    let mut lines = content.lines();
    let mut offset = 0usize;
    let mut first = lines.next()?;
    if first.starts_with("#!") {
        offset += first.len() + 1;
        first = lines.next()?;
    }
    if first.trim_end() != FRONTMATTER_START {
        return None;
    }
    offset += first.len() + 1;

    let mut yaml_lines = Vec::new();
    for line in lines.by_ref() {
        offset += line.len() + 1;
        if line.trim_end() == FRONTMATTER_START {
            let body = content.get(offset.min(content.len())..).unwrap_or("");
            return Some((yaml_lines.join("\n"), body));
        }
        yaml_lines.push(line.strip_prefix("# ").unwrap_or(line));
    }
    None
}

/// Parse a single-file script tool whose manifest is an embedded comment
/// frontmatter, returning the manifest and the script itself as its sole
/// attachment.
///
/// # Errors
///
/// Returns [`ManifestError::Parse`] if no frontmatter block is found, or any
/// error [`parse_tool_manifest`] would return for the embedded YAML.
pub fn parse_embedded_tool(
    content: &str,
    artifact: &str,
    script_relative_path: &str,
) -> Result<(ToolManifest, Vec<Attachment>), ManifestError> {
    let (yaml, _body) = extract_comment_frontmatter(content).ok_or_else(|| ManifestError::Parse {
        artifact: artifact.to_string(),
        reason: "no `# ---` frontmatter block found".to_string(),
    })?;
    let manifest = parse_tool_manifest(&yaml, artifact)?;
    let attachment = Attachment {
        relative_path: script_relative_path.to_string(),
        media_type: guess_media_type(script_relative_path),
        bytes: content.as_bytes().to_vec(),
    };
    Ok((manifest, vec![attachment]))
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

fn xml_text(reader: &mut Reader<&[u8]>) -> Result<String, quick_xml::Error> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(std::str::from_utf8(&c).unwrap_or_default()),
            Event::End(_) | Event::Eof => break,
            _ => {}
        }
    }
    Ok(text)
}

fn attr_value(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

/// Extract and parse exactly one `<directive name="..." version="...">…</directive>`
/// XML block embedded in a markdown document.
///
/// # Errors
///
/// Returns [`ManifestError::Parse`] if no `<directive>` block is found or the
/// XML is malformed, and [`ManifestError::Schema`] if required attributes or
/// children (`name`, `version`, `<description>`, `<model tier=.../>`) are
/// missing.
pub fn parse_directive(markdown: &str, artifact: &str) -> Result<Directive, ManifestError> {
    let start = markdown.find("<directive").ok_or_else(|| ManifestError::Parse {
        artifact: artifact.to_string(),
        reason: "no <directive> block found".to_string(),
    })?;
    let end = markdown
        .find("</directive>")
        .map(|i| i + "</directive>".len())
        .ok_or_else(|| ManifestError::Parse {
            artifact: artifact.to_string(),
            reason: "unterminated <directive> block".to_string(),
        })?;
    let xml = &markdown[start..end];

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut name = None;
    let mut version = None;
    let mut description = String::new();
    let mut model = None;
    let mut process = String::new();
    let mut tools = Vec::new();
    let mut permissions = Vec::new();
    let mut cost = CostBudget::default();

    loop {
        let event = reader.read_event().map_err(|e| ManifestError::Parse {
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })?;
        match event {
            Event::Start(e) if e.name().as_ref() == b"directive" => {
                name = attr_value(&e, "name");
                version = attr_value(&e, "version");
            }
            Event::Start(e) if e.name().as_ref() == b"description" => {
                description = xml_text(&mut reader).unwrap_or_default();
            }
            Event::Empty(e) if e.name().as_ref() == b"model" => {
                model = attr_value(&e, "tier").or_else(|| attr_value(&e, "id"));
            }
            Event::Start(e) if e.name().as_ref() == b"process" => {
                process = xml_text(&mut reader).unwrap_or_default();
            }
            Event::Empty(e) if e.name().as_ref() == b"tool" => {
                if let Some(id) = attr_value(&e, "id") {
                    tools.push(id);
                }
            }
            Event::Empty(e)
                if matches!(e.name().as_ref(), b"read" | b"write" | b"execute") =>
            {
                let capability = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if let Some(resource) = attr_value(&e, "resource") {
                    permissions.push(kiwi_core::PermissionDeclaration {
                        capability,
                        scope: resource,
                        path: attr_value(&e, "path"),
                    });
                }
            }
            Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"cost" => {
                if let Some(v) = attr_value(&e, "max_turns").and_then(|v| v.parse().ok()) {
                    cost.max_turns = v;
                }
                if let Some(v) = attr_value(&e, "max_tokens").and_then(|v| v.parse().ok()) {
                    cost.max_tokens = Some(v);
                }
                if let Some(v) = attr_value(&e, "max_usd").and_then(|v| v.parse().ok()) {
                    cost.max_usd = Some(v);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let name = name.ok_or_else(|| ManifestError::Schema {
        artifact: artifact.to_string(),
        reason: "<directive> missing required `name` attribute".to_string(),
    })?;
    let version = version.ok_or_else(|| ManifestError::Schema {
        artifact: artifact.to_string(),
        reason: "<directive> missing required `version` attribute".to_string(),
    })?;
    let model = model.ok_or_else(|| ManifestError::Schema {
        artifact: artifact.to_string(),
        reason: "<directive> missing required <model tier=.../> child".to_string(),
    })?;

    Ok(Directive {
        name,
        version,
        description,
        permissions,
        tools,
        process,
        cost,
        model,
    })
}

// ---------------------------------------------------------------------------
// Knowledge entries
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct KnowledgeFrontmatter {
    zettel_id: String,
    title: String,
    entry_type: EntryType,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    relationships: Vec<kiwi_core::Relationship>,
}

/// Parse a knowledge markdown document: `---`-delimited YAML frontmatter
/// plus the remaining body.
///
/// # Errors
///
/// Returns [`ManifestError::Parse`] if the document has no frontmatter
/// block, and [`ManifestError::Schema`] if the frontmatter YAML does not
/// match the required shape (`zettel_id`, `title`, `entry_type`).
pub fn parse_knowledge(markdown: &str, artifact: &str) -> Result<KnowledgeEntry, ManifestError> {
    let rest = markdown.strip_prefix("---\n").ok_or_else(|| ManifestError::Parse {
        artifact: artifact.to_string(),
        reason: "document does not start with `---` frontmatter delimiter".to_string(),
    })?;
    let end = rest.find("\n---").ok_or_else(|| ManifestError::Parse {
        artifact: artifact.to_string(),
        reason: "unterminated frontmatter block".to_string(),
    })?;
    let frontmatter_yaml = &rest[..end];
    let body = rest[end..]
        .strip_prefix("\n---")
        .unwrap_or(&rest[end..])
        .trim_start_matches('\n')
        .to_string();

    let frontmatter: KnowledgeFrontmatter =
        serde_yaml::from_str(frontmatter_yaml).map_err(|e| ManifestError::Schema {
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })?;

    Ok(KnowledgeEntry {
        zettel_id: frontmatter.zettel_id,
        title: frontmatter.title,
        entry_type: frontmatter.entry_type,
        tags: frontmatter.tags,
        relationships: frontmatter.relationships,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_manifest_round_trips_through_canonical_json() {
        let yaml = "tool_id: python_runtime\ntool_type: runtime\nversion: \"1.0.0\"\nexecutor: subprocess_exec\nconfig: {}\nparameters: []\nrequired_capabilities: []\n";
        let manifest = parse_tool_manifest(yaml, "python_runtime.yaml").unwrap();
        let json = kiwi_core::canonical_json(&manifest).unwrap();
        let reparsed: ToolManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn invalid_tool_id_is_a_schema_error() {
        let yaml = "tool_id: \"Bad-Id\"\ntool_type: runtime\nversion: \"1.0.0\"\nexecutor: x\n";
        let err = parse_tool_manifest(yaml, "x.yaml").unwrap_err();
        assert!(matches!(err, ManifestError::Schema { .. }));
    }

    #[test]
    fn primitive_with_executor_is_a_semantic_error() {
        let yaml =
            "tool_id: shell_exec\ntool_type: primitive\nkind: subprocess\nversion: \"1.0.0\"\nexecutor: should_be_null\n";
        let err = parse_tool_manifest(yaml, "x.yaml").unwrap_err();
        assert!(matches!(err, ManifestError::Semantic { .. }));
    }

    #[test]
    fn embedded_frontmatter_is_extracted_from_a_script() {
        let script = "#!/usr/bin/env python3\n# ---\n# tool_id: greeter\n# tool_type: script\n# version: \"1.0.0\"\n# executor: python_runtime\n# ---\nprint('hello')\n";
        let (manifest, attachments) = parse_embedded_tool(script, "greeter.py", "greeter.py").unwrap();
        assert_eq!(manifest.tool_id, "greeter");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].media_type, "text/x-python");
    }

    #[test]
    fn directive_xml_block_parses_required_fields() {
        let markdown = r#"# My Directive

<directive name="ship-it" version="1.0.0">
  <metadata>
    <description>Ships the thing.</description>
    <model tier="standard"/>
  </metadata>
  <process>do the thing</process>
</directive>
"#;
        let directive = parse_directive(markdown, "ship-it.md").unwrap();
        assert_eq!(directive.name, "ship-it");
        assert_eq!(directive.model, "standard");
        assert_eq!(directive.description, "Ships the thing.");
    }

    #[test]
    fn directive_missing_model_is_a_schema_error() {
        let markdown = "<directive name=\"x\" version=\"1.0.0\"><metadata><description>d</description></metadata></directive>";
        let err = parse_directive(markdown, "x.md").unwrap_err();
        assert!(matches!(err, ManifestError::Schema { .. }));
    }

    #[test]
    fn knowledge_frontmatter_parses() {
        let markdown = "---\nzettel_id: z1\ntitle: Title\nentry_type: concept\ntags: [a, b]\n---\nBody text.\n";
        let entry = parse_knowledge(markdown, "z1.md").unwrap();
        assert_eq!(entry.zettel_id, "z1");
        assert_eq!(entry.tags, vec!["a", "b"]);
        assert_eq!(entry.body.trim(), "Body text.");
    }

    #[test]
    fn knowledge_without_frontmatter_is_a_parse_error() {
        let err = parse_knowledge("just a markdown body", "x.md").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }
}
