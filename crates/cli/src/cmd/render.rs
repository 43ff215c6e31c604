use anyhow::{Context, Result};
use argp::FromArgs;
use buildrelay_jobs::template;
use typed_path::Utf8NativePathBuf;

use crate::util::native_path;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Render a deployment template locally, as a git_ops job would for a build.
#[argp(subcommand, name = "render")]
pub struct Args {
    #[argp(positional, from_str_fn(native_path))]
    /// template file
    template: Utf8NativePathBuf,
    #[argp(option, short = 't')]
    /// value bound to `tag` (the built commit SHA)
    tag: String,
    #[argp(option, short = 'o', from_str_fn(native_path))]
    /// write the rendered file to output file
    output: Option<Utf8NativePathBuf>,
}

pub fn run(args: Args) -> Result<()> {
    let source = std::fs::read_to_string(args.template.with_platform_encoding())
        .with_context(|| format!("Failed to read {}", args.template))?;
    let rendered = template::render(args.template.as_str(), &source, &args.tag)?;
    if let Some(out_path) = &args.output {
        std::fs::write(out_path.with_platform_encoding(), rendered)
            .with_context(|| format!("Failed to write output file '{}'", out_path))?;
    } else {
        print!("{}", rendered);
    }
    Ok(())
}
