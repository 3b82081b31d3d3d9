/// Renderer command line
use crate::config::loader::RendererConfig;
use crate::config::types::RenderResource;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

/// The single frame every render request produces
pub const RENDER_FRAME: u32 = 1;

/// Fully resolved renderer invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl RenderInvocation {
    /// `<bin> -b -Y <input> [-E engine] [extra..] -o <prefix> -F <fmt> -f 1 [-- --cycles-device <dev>]`
    ///
    /// Arguments are order-sensitive: `-Y` must precede the input file to
    /// stop embedded scripts from running on load, and `-f` triggers the
    /// render, so everything configuring it comes first.
    pub fn build(config: &RendererConfig, resource: &RenderResource) -> Self {
        let mut args: Vec<OsString> = vec![
            "-b".into(),
            "--disable-autoexec".into(),
            resource.input_path.clone().into(),
        ];

        if let Some(engine) = &config.engine {
            args.push("-E".into());
            args.push(engine.into());
        }
        args.extend(config.extra_args.iter().map(OsString::from));

        args.push("-o".into());
        args.push(resource.output_prefix.clone().into());
        args.push("-F".into());
        args.push(config.output_format.clone().into());
        args.push("-f".into());
        args.push(RENDER_FRAME.to_string().into());

        if let Some(device) = &config.cycles_device {
            args.push("--".into());
            args.push("--cycles-device".into());
            args.push(device.into());
        }

        Self {
            program: config.binary.clone(),
            args,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Printable form for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ResourceKey;

    fn resource() -> RenderResource {
        RenderResource {
            key: ResourceKey::parse("scene").unwrap(),
            input_path: PathBuf::from("/workspace/uploads/scene.blend"),
            output_prefix: PathBuf::from("/workspace/output/scene"),
            artifact_path: PathBuf::from("/workspace/output/scene0001.png"),
        }
    }

    #[test]
    fn default_invocation_disables_autoexec_before_loading() {
        let inv = RenderInvocation::build(&RendererConfig::default(), &resource());
        assert_eq!(
            inv.display(),
            "blender -b --disable-autoexec /workspace/uploads/scene.blend \
             -o /workspace/output/scene -F PNG -f 1"
        );
    }

    #[test]
    fn engine_extra_args_and_device_are_placed_around_the_frame() {
        let config = RendererConfig {
            engine: Some("CYCLES".to_string()),
            cycles_device: Some("CUDA".to_string()),
            extra_args: vec!["--threads".to_string(), "4".to_string()],
            ..RendererConfig::default()
        };
        let inv = RenderInvocation::build(&config, &resource());
        let args: Vec<String> = inv
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let pos = |needle: &str| args.iter().position(|a| a == needle).unwrap();
        assert!(pos("--disable-autoexec") < pos("/workspace/uploads/scene.blend"));
        assert!(pos("-E") < pos("-f"));
        assert!(pos("--threads") < pos("-o"));
        assert_eq!(&args[args.len() - 3..], ["--", "--cycles-device", "CUDA"]);
    }
}
