use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, UndefinedBehavior, context, syntax::SyntaxConfig};

/// Renders a deployment template with `tag` bound to the built commit.
///
/// Templates use `<%= expr %>` for output, `<% stmt %>` for blocks and `<%# ... %>` for
/// comments. Anything else, including `{{ }}`, is copied verbatim. Referencing a variable
/// other than `tag` is an error.
pub fn render(name: &str, source: &str, tag: &str) -> Result<String> {
    environment()?
        .render_named_str(name, source, context! { tag })
        .with_context(|| format!("Failed to render template {name}"))
}

fn environment() -> Result<Environment<'static>> {
    let syntax = SyntaxConfig::builder()
        .block_delimiters("<%", "%>")
        .variable_delimiters("<%=", "%>")
        .comment_delimiters("<%#", "%>")
        .build()
        .context("Failed to build template syntax")?;
    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    // Output is YAML or similar, never HTML; the tag must not be quoted or escaped.
    env.set_auto_escape_callback(|_| AutoEscape::None);
    Ok(env)
}
