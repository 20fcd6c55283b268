#![cfg(target_os = "android")]
use std::{net::Ipv4Addr, path::PathBuf, sync::Arc, thread};

use android_activity::{AndroidApp, MainEvent, PollEvent};
use anyhow::{Context, anyhow};
use axum::Router;
use double_apk_bridge::{
    BRIDGE_BASE_PATH, BridgeConfig, BridgeState, IntentRequest, Platform, PromptReceiver,
    create_router,
};
use jni::{
    JNIEnv, JavaVM,
    objects::{JObject, JString, JValue},
};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

const BRIDGE_PORT: u16 = 4570;
const WEBVIEW_ACTIVITY: &str = "app.double.shell.WebviewActivity";

/// Starts activities through the hosting app's context.
struct JniPlatform;

impl Platform for JniPlatform {
    fn start_activity(&self, request: &IntentRequest) -> anyhow::Result<()> {
        let ctx = ndk_context::android_context();
        let vm = unsafe { JavaVM::from_raw(ctx.vm().cast()) }?;
        let mut env = vm.attach_current_thread()?;
        let context = unsafe { JObject::from_raw(ctx.context().cast()) };

        let result = start_activity_with(&mut env, &context, request);
        if result.is_err() && env.exception_check().unwrap_or(false) {
            let _ = env.exception_describe();
            let _ = env.exception_clear();
        }
        result.with_context(|| format!("startActivity({})", request.action))
    }
}

fn start_activity_with(
    env: &mut JNIEnv,
    context: &JObject,
    request: &IntentRequest,
) -> anyhow::Result<()> {
    // file:// data URIs are rejected by StrictMode from API 24 unless the VM
    // policy is relaxed.
    if request.file_path().is_some() {
        let builder = env.new_object("android/os/StrictMode$VmPolicy$Builder", "()V", &[])?;
        let policy = env
            .call_method(&builder, "build", "()Landroid/os/StrictMode$VmPolicy;", &[])?
            .l()?;
        env.call_static_method(
            "android/os/StrictMode",
            "setVmPolicy",
            "(Landroid/os/StrictMode$VmPolicy;)V",
            &[JValue::Object(&policy)],
        )?;
    }

    let action = env.new_string(&request.action)?;
    let intent = env.new_object(
        "android/content/Intent",
        "(Ljava/lang/String;)V",
        &[JValue::Object(&action)],
    )?;

    if let Some(data) = &request.data {
        let data = env.new_string(data)?;
        let uri = env
            .call_static_method(
                "android/net/Uri",
                "parse",
                "(Ljava/lang/String;)Landroid/net/Uri;",
                &[JValue::Object(&data)],
            )?
            .l()?;
        match &request.mime_type {
            Some(mime) => {
                let mime = env.new_string(mime)?;
                env.call_method(
                    &intent,
                    "setDataAndType",
                    "(Landroid/net/Uri;Ljava/lang/String;)Landroid/content/Intent;",
                    &[JValue::Object(&uri), JValue::Object(&mime)],
                )?;
            }
            None => {
                env.call_method(
                    &intent,
                    "setData",
                    "(Landroid/net/Uri;)Landroid/content/Intent;",
                    &[JValue::Object(&uri)],
                )?;
            }
        }
    }

    env.call_method(
        &intent,
        "addFlags",
        "(I)Landroid/content/Intent;",
        &[JValue::Int(request.flags)],
    )?;
    env.call_method(
        context,
        "startActivity",
        "(Landroid/content/Intent;)V",
        &[JValue::Object(&intent)],
    )?;

    info!("✅ Intent started: {}", request.action);
    Ok(())
}

fn init_tracing() {
    if let Err(err) = LogTracer::init() {
        eprintln!("Failed to set logger: {err}");
    }
    let filter = EnvFilter::new("info,double_android=trace,double_apk_bridge=debug,jni=info");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {err}");
    }
}

#[unsafe(no_mangle)]
fn android_main(app: AndroidApp) {
    init_tracing();
    info!("Starting Double...");

    let Some(files_dir) = app.internal_data_path() else {
        error!("❌ No internal data path; bridge not started");
        return;
    };

    thread::spawn(move || {
        info!("Starting Bridge Runtime...");
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(err) => {
                error!("Failed to build Tokio runtime: {err}");
                return;
            }
        };
        if let Err(err) = rt.block_on(start_bridge_server(files_dir)) {
            error!("Bridge Server Crashed: {err:#}");
        }
    });

    if let Err(err) = launch_webview_activity(&app) {
        error!("❌ Failed to launch Webview Activity: {err:#}");
    }

    let mut destroyed = false;
    while !destroyed {
        app.poll_events(None, |event| {
            if let PollEvent::Main(MainEvent::Destroy) = event {
                destroyed = true;
            }
        });
    }
    info!("🛑 Activity destroyed.");
}

async fn start_bridge_server(data_dir: PathBuf) -> anyhow::Result<()> {
    info!("🚀 Initializing Double bridge on port {BRIDGE_PORT}...");
    let config = BridgeConfig::new(data_dir).with_env_overrides();
    let (state, prompts) = BridgeState::new(config, Arc::new(JniPlatform))?;
    tokio::spawn(confirm_prompts(prompts));

    let startup = state.clone();
    tokio::spawn(async move { startup.on_start().await });

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true);
    let app = Router::new()
        .nest(BRIDGE_BASE_PATH, create_router(state))
        .layer(cors);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, BRIDGE_PORT))
        .await
        .context("Failed to bind bridge socket")?;
    info!("✅ Bridge Server Running.");
    axum::serve(listener, app).await?;
    Ok(())
}

// The settings screen opened after confirmation already explains the
// permission, so the native shell does not show its own dialog.
async fn confirm_prompts(mut prompts: PromptReceiver) {
    while let Some(prompt) = prompts.recv().await {
        info!("Confirming permission prompt for {}", prompt.purpose);
        prompt.confirm();
    }
    warn!("Permission prompt channel closed");
}

fn launch_webview_activity(app: &AndroidApp) -> anyhow::Result<()> {
    info!("🚀 Launching Native Webview Activity...");

    let vm = unsafe { JavaVM::from_raw(app.vm_as_ptr().cast()) }?;
    let mut env = vm.attach_current_thread()?;
    let context = unsafe { JObject::from_raw(app.activity_as_ptr().cast()) };

    let intent = env.new_object("android/content/Intent", "()V", &[])?;
    let pkg_name = get_package_name(&mut env, &context)?;
    let pkg_name_jstr = env.new_string(&pkg_name)?;
    let activity_class_name = env.new_string(WEBVIEW_ACTIVITY)?;
    env.call_method(
        &intent,
        "setClassName",
        "(Ljava/lang/String;Ljava/lang/String;)Landroid/content/Intent;",
        &[
            JValue::Object(&pkg_name_jstr),
            JValue::Object(&activity_class_name),
        ],
    )?;

    // The activity injects this script into every page it loads.
    let key = env.new_string("bridge_script_url")?;
    let script_url = env.new_string(format!(
        "http://127.0.0.1:{BRIDGE_PORT}{BRIDGE_BASE_PATH}/bridge.js"
    ))?;
    env.call_method(
        &intent,
        "putExtra",
        "(Ljava/lang/String;Ljava/lang/String;)Landroid/content/Intent;",
        &[JValue::Object(&key), JValue::Object(&script_url)],
    )?;

    env.call_method(
        &context,
        "startActivity",
        "(Landroid/content/Intent;)V",
        &[JValue::Object(&intent)],
    )
    .map_err(|err| anyhow!("startActivity failed: {err}"))?;
    Ok(())
}

fn get_package_name(env: &mut JNIEnv, context: &JObject) -> jni::errors::Result<String> {
    let package_jstr_obj = env
        .call_method(context, "getPackageName", "()Ljava/lang/String;", &[])?
        .l()?;
    let package_jstr: JString = package_jstr_obj.into();
    let rust_string: String = env.get_string(&package_jstr)?.into();
    Ok(rust_string)
}
