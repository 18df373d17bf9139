//! # JNI Callback Forwarding
//!
//! Installs callback handlers that call back into the Java
//! `CallbackHandler` object. Handlers run on callback worker threads, which
//! are attached to the JVM on first use.

use std::sync::Arc;

use jni::objects::{GlobalRef, JObject, JValue};
use jni::{JNIEnv, JavaVM};

use crate::bridge::callback::{callback_type, log_level, CallbackData, CallbackHandler};

/// The Java callback object plus the VM to reach it from any thread
pub struct JavaCallbackTarget {
    vm: JavaVM,
    handler: GlobalRef,
}

impl JavaCallbackTarget {
    pub fn new(env: &mut JNIEnv, handler: JObject) -> jni::errors::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            vm: env.get_java_vm()?,
            handler: env.new_global_ref(handler)?,
        }))
    }

    fn call(&self, name: &str, f: impl FnOnce(&mut JNIEnv, &JObject) -> jni::errors::Result<()>) {
        let mut env = match self.vm.attach_current_thread_permanently() {
            Ok(env) => env,
            Err(e) => {
                log::error!("Cannot attach callback thread to JVM: {}", e);
                return;
            }
        };

        if let Err(e) = f(&mut env, self.handler.as_obj()) {
            log::warn!("Java callback {} failed: {}", name, e);
            if env.exception_check().unwrap_or(false) {
                let _ = env.exception_clear();
            }
        }
    }

    pub fn on_error(&self, code: i32, message: &str, details: &str) {
        self.call("onError", |env, handler| {
            let j_message = env.new_string(message)?;
            let j_details = env.new_string(details)?;
            env.call_method(
                handler,
                "onError",
                "(ILjava/lang/String;Ljava/lang/String;)V",
                &[
                    JValue::Int(code),
                    JValue::Object(&j_message),
                    JValue::Object(&j_details),
                ],
            )?;
            Ok(())
        });
    }

    pub fn on_log(&self, level: i32, module: &str, message: &str) {
        self.call("onLog", |env, handler| {
            let j_module = env.new_string(module)?;
            let j_message = env.new_string(message)?;
            env.call_method(
                handler,
                "onLog",
                "(ILjava/lang/String;Ljava/lang/String;)V",
                &[
                    JValue::Int(level),
                    JValue::Object(&j_module),
                    JValue::Object(&j_message),
                ],
            )?;
            Ok(())
        });
    }

    pub fn on_chunk_complete(&self, x: i32, z: i32, handle: i64) {
        self.call("onChunkComplete", |env, handler| {
            env.call_method(
                handler,
                "onChunkComplete",
                "(IIJII)V",
                &[
                    JValue::Int(x),
                    JValue::Int(z),
                    JValue::Long(handle),
                    JValue::Int(0),
                    JValue::Int(0),
                ],
            )?;
            Ok(())
        });
    }

    pub fn on_simple(&self, kind: i32, value: i32) {
        self.call("onSimpleCallback", |env, handler| {
            env.call_method(
                handler,
                "onSimpleCallback",
                "(II)V",
                &[JValue::Int(kind), JValue::Int(value)],
            )?;
            Ok(())
        });
    }
}

/// Route callbacks to the Java object. Kinds with no Java counterpart keep
/// their default handlers.
pub fn register(env: &mut JNIEnv, callbacks: &CallbackHandler, handler: JObject) -> jni::errors::Result<()> {
    let target = JavaCallbackTarget::new(env, handler)?;

    let t = target.clone();
    callbacks.register_handler(callback_type::ERROR, move |data| {
        t.on_error(
            data.get_int("code", 0),
            data.get_string("message", "Unknown error"),
            data.get_string("details", ""),
        );
    });

    let t = target.clone();
    callbacks.register_handler(callback_type::LOG, move |data| {
        t.on_log(
            data.get_int("level", log_level::INFO),
            data.get_string("module", "native"),
            data.get_string("message", ""),
        );
    });

    let t = target.clone();
    callbacks.register_handler(callback_type::CHUNK_READY, move |data| {
        t.on_chunk_complete(data.get_int("x", 0), data.get_int("z", 0), data.get_long("handle", 0));
    });

    for (kind, level) in [
        (callback_type::MEMORY_WARNING, log_level::WARN),
        (callback_type::MEMORY_CRITICAL, log_level::ERROR),
    ] {
        let t = target.clone();
        callbacks.register_handler(kind, move |data: &CallbackData| {
            let message = format!(
                "{} (Used: {} / Max: {})",
                data.get_string("message", ""),
                data.get_long("used", 0),
                data.get_long("max", 0)
            );
            t.on_log(level, "memory", &message);
        });
    }

    for kind in [
        callback_type::FRAME_READY,
        callback_type::ENTITY_REMOVED,
        callback_type::SOUND_COMPLETE,
    ] {
        let t = target.clone();
        callbacks.register_handler(kind, move |data: &CallbackData| {
            let value = data.get_int("id", data.get_int("value", 0));
            t.on_simple(kind, value);
        });
    }

    log::debug!("Java callback handler registered");
    Ok(())
}
