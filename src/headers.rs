//! Headers emitter (§4.I): a static response-policy text artefact
//! consumed by the edge, plus the in-process representation the output
//! guard (§4.G) checks for script-permissive directives.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::BuildError;

/// One `Header: Value` line inside a block.
#[derive(Debug, Clone)]
pub struct HeaderLine {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// A path-pattern-scoped block of header directives.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    /// Path pattern this block applies to (e.g. `/*`, `*.html`).
    pub pattern: String,
    /// Header lines, in declaration order.
    pub lines: Vec<HeaderLine>,
}

/// A contribution a security plugin may declare toward the materialised
/// policy (§4.E stage 4: "the output guard policy is materialised from the
/// union of security-plugin declarations").
#[derive(Debug, Clone)]
pub struct PolicyFragment {
    /// Extra `Content-Security-Policy` source directives to merge in,
    /// e.g. `("img-src", vec!["https://cdn.example.com"])`.
    pub extra_csp_sources: Vec<(String, Vec<String>)>,
}

/// The full declared response policy.
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    /// Blocks, in declaration order: global first, then per-extension.
    pub blocks: Vec<HeaderBlock>,
}

const CSP_DIRECTIVES_THAT_PERMIT_SCRIPT: &[&str] = &["script-src", "script-src-elem", "script-src-attr"];

impl HeaderPolicy {
    /// Build the default policy: a global block plus per-extension blocks
    /// for HTML, long-cached hashed assets, images, and fonts (§4.I).
    #[must_use]
    pub fn default_policy(fragments: &[PolicyFragment]) -> Self {
        let mut csp = vec![
            ("default-src".to_string(), vec!["'none'".to_string()]),
            ("img-src".to_string(), vec!["'self'".to_string()]),
            ("style-src".to_string(), vec!["'self'".to_string()]),
            ("font-src".to_string(), vec!["'self'".to_string()]),
            ("base-uri".to_string(), vec!["'none'".to_string()]),
            ("form-action".to_string(), vec!["'none'".to_string()]),
            ("frame-ancestors".to_string(), vec!["'none'".to_string()]),
        ];
        for fragment in fragments {
            for (directive, sources) in &fragment.extra_csp_sources {
                if let Some(existing) = csp.iter_mut().find(|(name, _)| name == directive) {
                    for src in sources {
                        if !existing.1.contains(src) {
                            existing.1.push(src.clone());
                        }
                    }
                } else {
                    csp.push((directive.clone(), sources.clone()));
                }
            }
        }

        let csp_value = csp
            .iter()
            .map(|(directive, sources)| format!("{directive} {}", sources.join(" ")))
            .collect::<Vec<_>>()
            .join("; ")
            + "; block-all-mixed-content; upgrade-insecure-requests";

        let global = HeaderBlock {
            pattern: "/*".to_string(),
            lines: vec![
                HeaderLine {
                    name: "Content-Security-Policy".to_string(),
                    value: csp_value,
                },
                HeaderLine {
                    name: "Strict-Transport-Security".to_string(),
                    value: "max-age=63072000; includeSubDomains; preload".to_string(),
                },
                HeaderLine {
                    name: "X-Frame-Options".to_string(),
                    value: "DENY".to_string(),
                },
                HeaderLine {
                    name: "Cross-Origin-Embedder-Policy".to_string(),
                    value: "require-corp".to_string(),
                },
                HeaderLine {
                    name: "Cross-Origin-Opener-Policy".to_string(),
                    value: "same-origin".to_string(),
                },
                HeaderLine {
                    name: "Cross-Origin-Resource-Policy".to_string(),
                    value: "same-origin".to_string(),
                },
                HeaderLine {
                    name: "Referrer-Policy".to_string(),
                    value: "no-referrer".to_string(),
                },
                HeaderLine {
                    name: "Permissions-Policy".to_string(),
                    value: "camera=(), microphone=(), geolocation=(), payment=(), usb=()".to_string(),
                },
                HeaderLine {
                    name: "X-Content-Type-Options".to_string(),
                    value: "nosniff".to_string(),
                },
            ],
        };

        let html = HeaderBlock {
            pattern: "*.html".to_string(),
            lines: vec![HeaderLine {
                name: "Cache-Control".to_string(),
                value: "public, max-age=300, must-revalidate".to_string(),
            }],
        };

        let hashed_assets = HeaderBlock {
            pattern: "/static/*".to_string(),
            lines: vec![HeaderLine {
                name: "Cache-Control".to_string(),
                value: "public, max-age=31536000, immutable".to_string(),
            }],
        };

        let images = HeaderBlock {
            pattern: "*.{png,jpg,jpeg,webp,avif,svg}".to_string(),
            lines: vec![HeaderLine {
                name: "Cache-Control".to_string(),
                value: "public, max-age=604800".to_string(),
            }],
        };

        let fonts = HeaderBlock {
            pattern: "*.{woff,woff2,ttf,otf}".to_string(),
            lines: vec![
                HeaderLine {
                    name: "Cache-Control".to_string(),
                    value: "public, max-age=31536000, immutable".to_string(),
                },
                HeaderLine {
                    name: "Access-Control-Allow-Origin".to_string(),
                    value: "*".to_string(),
                },
            ],
        };

        Self {
            blocks: vec![global, html, hashed_assets, images, fonts],
        }
    }

    /// Serialise to the text format consumed by the edge (§6): each block
    /// starts with a path pattern line, two-space-indented `Name: Value`
    /// lines follow, and a blank line terminates the block.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            let _ = writeln!(out, "{}", block.pattern);
            for line in &block.lines {
                let _ = writeln!(out, "  {}: {}", line.name, line.value);
            }
            out.push('\n');
        }
        out
    }

    /// Returns the CSP directives (if any) that would permit script
    /// execution. The output guard (§4.G) fails the build if this is
    /// non-empty and the value is not an explicit `'none'`.
    #[must_use]
    pub fn script_permissive_directives(&self) -> Vec<String> {
        let Some(global) = self.blocks.first() else {
            return Vec::new();
        };
        let Some(csp) = global
            .lines
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case("Content-Security-Policy"))
        else {
            return vec!["Content-Security-Policy header is absent".to_string()];
        };
        CSP_DIRECTIVES_THAT_PERMIT_SCRIPT
            .iter()
            .filter(|name| {
                csp.value
                    .split(';')
                    .any(|directive| directive.trim_start().starts_with(**name))
            })
            .map(|name| (*name).to_string())
            .collect()
    }

    /// Write the policy to `headers.txt` inside `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] on a filesystem failure.
    pub fn write(&self, output_dir: &Path) -> Result<(), BuildError> {
        let path = output_dir.join("headers.txt");
        std::fs::write(&path, self.render()).map_err(|e| BuildError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_block_denies_default_src() {
        let policy = HeaderPolicy::default_policy(&[]);
        let rendered = policy.render();
        assert!(rendered.contains("default-src 'none'"));
    }

    #[test]
    fn no_script_permissive_directives_by_default() {
        let policy = HeaderPolicy::default_policy(&[]);
        assert!(policy.script_permissive_directives().is_empty());
    }

    #[test]
    fn blocks_terminate_with_blank_line() {
        let policy = HeaderPolicy::default_policy(&[]);
        let rendered = policy.render();
        assert!(rendered.contains("\n\n"));
    }

    #[test]
    fn fragment_merges_additional_sources() {
        let fragment = PolicyFragment {
            extra_csp_sources: vec![("img-src".to_string(), vec!["https://cdn.example.com".to_string()])],
        };
        let policy = HeaderPolicy::default_policy(&[fragment]);
        let rendered = policy.render();
        assert!(rendered.contains("img-src 'self' https://cdn.example.com"));
    }

    #[test]
    fn default_csp_value_matches_snapshot() {
        let policy = HeaderPolicy::default_policy(&[]);
        let csp = &policy.blocks[0].lines[0];
        assert_eq!(csp.name, "Content-Security-Policy");
        insta::assert_snapshot!(csp.value, @"default-src 'none'; img-src 'self'; style-src 'self'; font-src 'self'; base-uri 'none'; form-action 'none'; frame-ancestors 'none'; block-all-mixed-content; upgrade-insecure-requests");
    }
}
