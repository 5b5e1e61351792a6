//! Reference native module used by the CLI and the scenario tests.

use buffers::{BufferMode, ElementType};
use module_abi::{
    ModuleBuffer, ModuleContext, ModuleError, ModuleImage, ModuleParam, NativeModule, ThreadEntry,
    ThreadSetup,
};

/// Name the demo module registers under.
pub const NAME: &str = "demo";

/// Host callback `ping_host` invokes.
pub const PING_CALLBACK: &str = "ping";
/// Host callback a `spawn_echo` thread reports to once done.
pub const THREAD_DONE_CALLBACK: &str = "thread_done";

/// Functions the module exports.
pub const FUNCTIONS: &[&str] = &[
    "echo",
    "reverse",
    "sum_f32",
    "ping_host",
    "spawn_echo",
    "make_shared",
    "panic",
    "fail",
];

/// Loadable image of [`DemoModule`].
pub fn image() -> ModuleImage {
    ModuleImage::new(NAME, DemoModule::default)
}

/// Small set of functions covering every path across the boundary.
#[derive(Debug, Default)]
pub struct DemoModule {
    calls: u64,
}

impl NativeModule for DemoModule {
    fn call(
        &mut self,
        cx: &mut dyn ModuleContext,
        function: &str,
        params: Vec<ModuleParam>,
    ) -> Result<Vec<ModuleParam>, ModuleError> {
        self.calls += 1;
        log::debug!("demo call #{} `{function}` on {:?}", self.calls, cx.kind());
        match function {
            "echo" => Ok(params),
            "reverse" => params.into_iter().map(|p| reverse(cx, p)).collect(),
            "sum_f32" => sum_f32(cx, params),
            "ping_host" => {
                let params = if params.is_empty() {
                    vec![ModuleParam::from("pong")]
                } else {
                    params
                };
                cx.call_host(PING_CALLBACK, params)?;
                Ok(Vec::new())
            }
            "spawn_echo" => {
                let text = first_str(function, &params)?.to_owned();
                cx.spawn_thread(ThreadEntry::new(ThreadSetup::default(), move |cx| {
                    echo_from_thread(cx, text)
                }))?;
                Ok(Vec::new())
            }
            "make_shared" => {
                let text = first_str(function, &params)?;
                let buffer =
                    ModuleBuffer::read_only(cx.memory(), text.as_bytes().to_vec(), ElementType::U8)?;
                let second = buffer.share()?;
                Ok(vec![buffer.into(), second.into()])
            }
            "panic" => panic!("demo module asked to panic"),
            "fail" => Err(ModuleError::Failed("demo module asked to fail".to_owned())),
            other => Err(ModuleError::UnknownFunction(other.to_owned())),
        }
    }
}

fn first_str<'a>(function: &str, params: &'a [ModuleParam]) -> Result<&'a str, ModuleError> {
    params
        .first()
        .and_then(ModuleParam::as_str)
        .ok_or_else(|| ModuleError::invalid(function, "expected a string as the first parameter"))
}

fn reverse(cx: &mut dyn ModuleContext, param: ModuleParam) -> Result<ModuleParam, ModuleError> {
    match param {
        ModuleParam::Str(text) => Ok(text.chars().rev().collect::<String>().into()),
        ModuleParam::Buffer(mut buffer) if buffer.mode() == BufferMode::Mutable => {
            buffer.with_bytes_mut(|bytes| bytes.reverse())?;
            Ok(buffer.into())
        }
        ModuleParam::Buffer(buffer) => {
            let mut bytes = buffer.to_vec()?;
            bytes.reverse();
            Ok(ModuleBuffer::read_only(cx.memory(), bytes, buffer.element())?.into())
        }
    }
}

fn sum_f32(
    cx: &mut dyn ModuleContext,
    params: Vec<ModuleParam>,
) -> Result<Vec<ModuleParam>, ModuleError> {
    let mut total = 0.0f32;
    for param in &params {
        let buffer = param
            .as_buffer()
            .filter(|b| b.element() == ElementType::F32)
            .ok_or_else(|| ModuleError::invalid("sum_f32", "expected f32 buffers"))?;
        total += buffer.to_f32_vec()?.iter().sum::<f32>();
    }
    Ok(vec![ModuleBuffer::read_only_f32(cx.memory(), &[total])?.into()])
}

fn echo_from_thread(cx: &mut dyn ModuleContext, text: String) {
    let results = match cx.call_main("echo", vec![text.into()]) {
        Ok(results) => results,
        Err(err) => {
            log::error!("spawned demo thread could not reach the module: {err}");
            return;
        }
    };
    if let Err(err) = cx.call_host(THREAD_DONE_CALLBACK, results) {
        log::error!("spawned demo thread could not report back: {err}");
    }
}
