//! Minimal HAProxy configuration builder: named sections holding directive lines.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    name: String,
    options: Vec<String>,
}

impl Section {
    /// Append directives in order
    pub fn add<I, S>(&mut self, options: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn add_one(&mut self, option: impl Into<String>) -> &mut Self {
        self.options.push(option.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaproxyConfig {
    sections: Vec<Section>,
}

impl HaproxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the section with the given header, creating it at the end if it does not
    /// exist yet. A header therefore never appears twice in the output.
    pub fn section(&mut self, name: impl Into<String>) -> &mut Section {
        let name = name.into();
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section {
                    name,
                    options: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    /// Serialize: header line, indented directives, blank line after each section.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&section.name);
            out.push('\n');
            for option in &section.options {
                out.push_str("    ");
                out.push_str(option);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sections() {
        let mut c = HaproxyConfig::new();
        c.section("global").add(["quiet"]);
        c.section("defaults").add(["mode tcp", "timeout connect 5000ms"]);

        assert_eq!(
            c.render(),
            "global\n    quiet\n\ndefaults\n    mode tcp\n    timeout connect 5000ms\n\n"
        );
    }

    #[test]
    fn test_section_is_reused() {
        let mut c = HaproxyConfig::new();
        c.section("backend backend-80").add_one("balance roundrobin");
        c.section("global").add_one("quiet");
        c.section("backend backend-80").add_one("mode tcp");

        assert_eq!(
            c.render(),
            "backend backend-80\n    balance roundrobin\n    mode tcp\n\nglobal\n    quiet\n\n"
        );
    }

    #[test]
    fn test_empty_section_renders_header() {
        let mut c = HaproxyConfig::new();
        c.section("backend backend-81");
        assert_eq!(c.render(), "backend backend-81\n\n");
        assert_eq!(HaproxyConfig::new().render(), "");
    }
}
