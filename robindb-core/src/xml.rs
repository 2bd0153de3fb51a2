//! XML dump and restore
//!
//! The dump format is a plain element tree with no attributes:
//! `<rrd>` holding `<version>`, `<step>`, `<lastupdate>`, one `<ds>`
//! per datasource and one `<rra>` per archive. Unknown values are
//! spelled `U`. Restore parses the same tree back; the parser handles
//! exactly this dialect (elements, text, comments) and nothing more.

use crate::types::{format_double, parse_double};
use crate::{Result, RrdError};
use std::fmt::Display;

const INDENT: &str = "  ";

/// Streaming writer producing indented XML
pub(crate) struct XmlWriter {
    out: String,
    open_tags: Vec<&'static str>,
}

impl XmlWriter {
    pub(crate) fn new() -> Self {
        Self {
            out: String::new(),
            open_tags: Vec::new(),
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.open_tags.len() {
            self.out.push_str(INDENT);
        }
    }

    pub(crate) fn start_tag(&mut self, name: &'static str) {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        self.out.push_str(">\n");
        self.open_tags.push(name);
    }

    pub(crate) fn close_tag(&mut self) {
        let name = self.open_tags.pop().expect("unbalanced close_tag");
        self.indent();
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push_str(">\n");
    }

    pub(crate) fn write_tag(&mut self, name: &str, value: impl Display) {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
        self.out.push_str(&escape(&value.to_string()));
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push_str(">\n");
    }

    pub(crate) fn write_double_tag(&mut self, name: &str, value: f64) {
        self.write_tag(name, format_double(value));
    }

    pub(crate) fn write_comment(&mut self, text: &str) {
        self.indent();
        self.out.push_str("<!-- ");
        self.out.push_str(text);
        self.out.push_str(" -->\n");
    }

    pub(crate) fn finish(mut self) -> String {
        while !self.open_tags.is_empty() {
            self.close_tag();
        }
        self.out
    }
}

fn escape(text: &str) -> String {
    if !text.contains(['&', '<', '>']) {
        return text.to_string();
    }
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// One parsed element: child elements plus any directly contained text
pub(crate) struct XmlElement {
    name: String,
    children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    /// Parse a document into its root element
    pub(crate) fn parse(input: &str) -> Result<XmlElement> {
        let mut root = XmlElement {
            name: String::new(),
            children: Vec::new(),
            text: String::new(),
        };
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut rest = input;

        while let Some(lt) = rest.find('<') {
            let text = &rest[..lt];
            if let Some(current) = stack.last_mut() {
                current.text.push_str(text);
            }
            rest = &rest[lt..];
            if rest.starts_with("<!--") {
                let end = rest
                    .find("-->")
                    .ok_or_else(|| malformed("unterminated comment"))?;
                rest = &rest[end + 3..];
            } else if rest.starts_with("<?") {
                let end = rest.find("?>").ok_or_else(|| malformed("unterminated declaration"))?;
                rest = &rest[end + 2..];
            } else if rest.starts_with("</") {
                let end = rest.find('>').ok_or_else(|| malformed("unterminated end tag"))?;
                let name = rest[2..end].trim();
                let element = stack.pop().ok_or_else(|| malformed("unmatched end tag"))?;
                if element.name != name {
                    return Err(malformed(&format!(
                        "mismatched end tag: expected </{}>, got </{}>",
                        element.name, name
                    )));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root.children.push(element),
                }
                rest = &rest[end + 1..];
            } else {
                let end = rest.find('>').ok_or_else(|| malformed("unterminated start tag"))?;
                let name = rest[1..end].trim();
                if name.is_empty() || name.contains(['<', '&']) {
                    return Err(malformed("bad element name"));
                }
                stack.push(XmlElement {
                    name: name.to_string(),
                    children: Vec::new(),
                    text: String::new(),
                });
                rest = &rest[end + 1..];
            }
        }
        if !stack.is_empty() {
            return Err(malformed("unclosed element"));
        }
        match root.children.len() {
            1 => Ok(root.children.remove(0)),
            _ => Err(malformed("expected a single root element")),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn text(&self) -> String {
        unescape(self.text.trim())
    }

    pub(crate) fn child(&self, name: &str) -> Result<&XmlElement> {
        self.children
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| malformed(&format!("missing <{}> under <{}>", name, self.name)))
    }

    pub(crate) fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub(crate) fn child_text(&self, name: &str) -> Result<String> {
        Ok(self.child(name)?.text())
    }

    pub(crate) fn child_long(&self, name: &str) -> Result<i64> {
        let text = self.child_text(name)?;
        text.parse()
            .map_err(|_| malformed(&format!("bad integer in <{}>: {}", name, text)))
    }

    pub(crate) fn child_double(&self, name: &str) -> Result<f64> {
        parse_double(&self.child_text(name)?)
    }
}

fn malformed(detail: &str) -> RrdError {
    RrdError::InvalidArgument(format!("Malformed XML dump: {}", detail))
}

/// Fully parsed dump, ready to be injected into a fresh database
pub(crate) struct XmlImport {
    pub version: i32,
    pub step: i64,
    pub last_update: i64,
    pub datasources: Vec<DsImport>,
    pub archives: Vec<ArcImport>,
}

pub(crate) struct DsImport {
    pub name: String,
    pub ds_type: String,
    pub heartbeat: i64,
    pub min: f64,
    pub max: f64,
    pub last_value: f64,
    pub accum_value: f64,
    pub nan_seconds: i64,
}

pub(crate) struct ArcImport {
    pub consol_fun: String,
    pub xff: f64,
    pub steps: i64,
    /// `(accum_value, nan_steps)` per datasource
    pub states: Vec<(f64, i64)>,
    /// One value per datasource per row, oldest row first
    pub rows: Vec<Vec<f64>>,
}

impl XmlImport {
    pub(crate) fn parse(input: &str) -> Result<XmlImport> {
        let rrd = XmlElement::parse(input)?;
        if rrd.name() != "rrd" {
            return Err(malformed("root element must be <rrd>"));
        }
        let version = rrd.child_long("version")? as i32;
        let step = rrd.child_long("step")?;
        let last_update = rrd.child_long("lastupdate")?;

        let mut datasources = Vec::new();
        for ds in rrd.children("ds") {
            datasources.push(DsImport {
                name: ds.child_text("name")?,
                ds_type: ds.child_text("type")?,
                heartbeat: ds.child_long("minimal_heartbeat")?,
                min: ds.child_double("min")?,
                max: ds.child_double("max")?,
                last_value: ds.child_double("last_ds")?,
                accum_value: ds.child_double("value")?,
                nan_seconds: ds.child_long("unknown_sec")?,
            });
        }
        if datasources.is_empty() {
            return Err(malformed("no <ds> elements"));
        }

        let mut archives = Vec::new();
        for rra in rrd.children("rra") {
            let mut states = Vec::new();
            for ds in rra.child("cdp_prep")?.children("ds") {
                states.push((
                    ds.child_double("value")?,
                    ds.child_long("unknown_datapoints")?,
                ));
            }
            if states.len() != datasources.len() {
                return Err(malformed("cdp_prep count does not match datasources"));
            }
            let mut rows = Vec::new();
            for row in rra.child("database")?.children("row") {
                let values: Vec<f64> = row
                    .children("v")
                    .map(|v| parse_double(&v.text()))
                    .collect::<Result<_>>()?;
                if values.len() != datasources.len() {
                    return Err(malformed("row width does not match datasources"));
                }
                rows.push(values);
            }
            if rows.is_empty() {
                return Err(malformed("empty <database>"));
            }
            archives.push(ArcImport {
                consol_fun: rra.child_text("cf")?,
                xff: rra.child_double("xff")?,
                steps: rra.child_long("pdp_per_row")?,
                states,
                rows,
            });
        }
        if archives.is_empty() {
            return Err(malformed("no <rra> elements"));
        }

        Ok(XmlImport {
            version,
            step,
            last_update,
            datasources,
            archives,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_nesting() {
        let mut writer = XmlWriter::new();
        writer.start_tag("rrd");
        writer.write_tag("version", "0002");
        writer.write_comment("state");
        writer.start_tag("ds");
        writer.write_double_tag("min", f64::NAN);
        writer.close_tag();
        let out = writer.finish();
        assert_eq!(
            out,
            "<rrd>\n  <version>0002</version>\n  <!-- state -->\n  <ds>\n    <min>U</min>\n  </ds>\n</rrd>\n"
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let mut writer = XmlWriter::new();
        writer.start_tag("rrd");
        writer.write_tag("step", 300);
        writer.start_tag("ds");
        writer.write_tag("name", "a<b");
        writer.close_tag();
        let doc = writer.finish();

        let rrd = XmlElement::parse(&doc).unwrap();
        assert_eq!(rrd.name(), "rrd");
        assert_eq!(rrd.child_long("step").unwrap(), 300);
        assert_eq!(rrd.child("ds").unwrap().child_text("name").unwrap(), "a<b");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(XmlElement::parse("<a><b></a></b>").is_err());
        assert!(XmlElement::parse("<a>").is_err());
        assert!(XmlElement::parse("no markup").is_err());
        assert!(XmlElement::parse("<a></a><b></b>").is_err());
    }

    #[test]
    fn test_import_parsing() {
        let doc = "\
<rrd>
  <version>0002</version>
  <step>60</step>
  <lastupdate>1000000120</lastupdate>
  <ds>
    <name>x</name>
    <type>GAUGE</type>
    <minimal_heartbeat>120</minimal_heartbeat>
    <min>U</min>
    <max>U</max>
    <last_ds>20</last_ds>
    <value>U</value>
    <unknown_sec>0</unknown_sec>
  </ds>
  <rra>
    <cf>AVERAGE</cf>
    <pdp_per_row>1</pdp_per_row>
    <xff>0.5</xff>
    <cdp_prep>
      <ds>
        <value>U</value>
        <unknown_datapoints>0</unknown_datapoints>
      </ds>
    </cdp_prep>
    <database>
      <row>
        <v>10</v>
      </row>
      <row>
        <v>U</v>
      </row>
    </database>
  </rra>
</rrd>
";
        let import = XmlImport::parse(doc).unwrap();
        assert_eq!(import.version, 2);
        assert_eq!(import.step, 60);
        assert_eq!(import.last_update, 1000000120);
        assert_eq!(import.datasources.len(), 1);
        assert_eq!(import.datasources[0].name, "x");
        assert!(import.datasources[0].min.is_nan());
        assert_eq!(import.archives.len(), 1);
        assert_eq!(import.archives[0].rows.len(), 2);
        assert_eq!(import.archives[0].rows[0][0], 10.0);
        assert!(import.archives[0].rows[1][0].is_nan());
    }
}
