//! Tauri 2 plugin exposing the session core to a webview host.
//!
//! The host app registers `tauri_plugin_store` before this plugin; settings
//! are read from [`SETTINGS_STORE_FILE`] at setup.

use crate::app::SessionCore;
use crate::error::ListenerError;
use crate::lifecycle::AppLifecycle;
use crate::settings::{Settings, SETTINGS_STORE_FILE};
use crate::store::{CredentialStore, KeyringCredentialStore, MemoryCredentialStore};
use crate::types::{
  ConnectionState, IpcError, IpcResult, OutboundFrame, SendStatus, SessionState, UserRecord,
};
use serde::Serialize;
use serde_json::Map as JsonMap;
use std::sync::Arc;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, RunEvent, Runtime, State, WindowEvent};
use tauri_plugin_store::StoreBuilder;
use tracing::{info, warn};

pub const SESSION_STATE_EVENT: &str = "session:state";
pub const CONNECTION_STATE_EVENT: &str = "connection:state";
pub const MESSAGE_EVENT: &str = "message:received";

type CommandResult<T> = Result<T, IpcError>;

pub struct HostState {
  core: Arc<SessionCore>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
  pub state: SessionState,
  pub user: Option<UserRecord>,
}

fn load_settings<R: Runtime>(app: &AppHandle<R>) -> Result<Settings, Box<dyn std::error::Error>> {
  let store = StoreBuilder::new(app, SETTINGS_STORE_FILE).build()?;
  let overrides: JsonMap<_, _> = store.entries().into_iter().collect();
  Ok(Settings::from_map(overrides))
}

fn credential_store() -> Arc<dyn CredentialStore> {
  let keyring = KeyringCredentialStore::default();
  if keyring.is_available() {
    Arc::new(keyring)
  } else {
    warn!("OS keychain/secret service unavailable, session will not survive restart");
    Arc::new(MemoryCredentialStore::new())
  }
}

fn emit_failure(e: tauri::Error) -> ListenerError {
  ListenerError::Failed(e.to_string())
}

fn forward_events<R: Runtime>(app: &AppHandle<R>, core: &SessionCore) {
  let handle = app.clone();
  core.session().add_listener(move |change| {
    handle.emit(SESSION_STATE_EVENT, *change).map_err(emit_failure)
  });

  let handle = app.clone();
  core.connection().add_state_listener(move |state| {
    handle.emit(CONNECTION_STATE_EVENT, *state).map_err(emit_failure)
  });

  let handle = app.clone();
  core.connection().add_listener(move |message| {
    handle.emit(MESSAGE_EVENT, message.clone()).map_err(emit_failure)
  });
}

#[tauri::command]
async fn session_sign_in(
  state: State<'_, HostState>,
  identifier: String,
) -> CommandResult<IpcResult<()>> {
  Ok(match state.core.session().sign_in(&identifier).await {
    Ok(()) => IpcResult::ok(()),
    Err(e) => IpcResult::err(e.code(), e.to_string()),
  })
}

#[tauri::command]
async fn session_verify_code(
  state: State<'_, HostState>,
  identifier: String,
  code: String,
) -> CommandResult<IpcResult<UserRecord>> {
  Ok(match state.core.session().verify_code(&identifier, &code).await {
    Ok(user) => IpcResult::ok(user),
    Err(e) => IpcResult::err(e.code(), e.to_string()),
  })
}

#[tauri::command]
async fn session_sign_out(state: State<'_, HostState>) -> CommandResult<IpcResult<()>> {
  Ok(match state.core.session().sign_out().await {
    Ok(()) => IpcResult::ok(()),
    Err(e) => IpcResult::err("storage", e.to_string()),
  })
}

#[tauri::command]
async fn session_state(state: State<'_, HostState>) -> CommandResult<SessionSnapshot> {
  let session = state.core.session();
  Ok(SessionSnapshot {
    state: session.state().await,
    user: session.current_user().await,
  })
}

#[tauri::command]
async fn connection_state(state: State<'_, HostState>) -> CommandResult<ConnectionState> {
  Ok(state.core.connection().get_connection_state())
}

#[tauri::command]
async fn connection_send(
  state: State<'_, HostState>,
  recipient_id: String,
  content: String,
) -> CommandResult<IpcResult<SendStatus>> {
  let frame = OutboundFrame::message(&recipient_id, &content);
  Ok(match state.core.connection().send(frame).await {
    Ok(status) => IpcResult::ok(status),
    Err(e) => IpcResult::err(e.code(), e.to_string()),
  })
}

pub fn init<R: Runtime>() -> TauriPlugin<R> {
  Builder::new("tether")
    .invoke_handler(tauri::generate_handler![
      session_sign_in,
      session_verify_code,
      session_sign_out,
      session_state,
      connection_state,
      connection_send,
    ])
    .setup(|app, _api| {
      crate::logging::init();

      let settings = load_settings(app)?;
      let core = tauri::async_runtime::block_on(SessionCore::start(&settings, credential_store()))?;
      let core = Arc::new(core);

      forward_events(app, &core);
      app.manage(HostState { core });
      info!("tether plugin ready");
      Ok(())
    })
    .on_event(|app, event| match event {
      RunEvent::WindowEvent {
        event: WindowEvent::Focused(focused),
        ..
      } => {
        if let Some(state) = app.try_state::<HostState>() {
          let lifecycle = if *focused {
            AppLifecycle::Foreground
          } else {
            AppLifecycle::Background
          };
          state.core.lifecycle().set(lifecycle);
        }
      }
      RunEvent::Exit => {
        if let Some(state) = app.try_state::<HostState>() {
          let core = state.core.clone();
          tauri::async_runtime::block_on(async move { core.shutdown().await });
        }
      }
      _ => {}
    })
    .build()
}
