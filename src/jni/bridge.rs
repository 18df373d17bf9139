//! # JNI Bridge Implementation
//!
//! The native methods of Java's `dev.libs.bridge.NativeBridge` class. Each
//! export forwards to the [`HeadlessEngine`] behind the handle; readiness
//! gating and the lifecycle lock live on the Java side.
//!
//! ## Function Naming Convention
//!
//! `Java_<package>_<class>_<method>`, e.g.
//! `Java_dev_libs_bridge_NativeBridge_nativeCreateEngine`

use std::sync::Arc;

use jni::objects::{JByteArray, JByteBuffer, JClass, JObject, JString};
use jni::sys::{jboolean, jdouble, jfloat, jint, jlong};
use jni::JNIEnv;
use parking_lot::{const_rwlock, RwLock};

use super::types::{direct_bytes, direct_object_slice, from_jboolean, java_string, to_jboolean};
use crate::bridge::{catalog, CallbackHandler, HeadlessContext, HeadlessEngine, NativeEngine};
use crate::error::VoidResult;
use crate::memory::{AssetCache, VoidManager};
use crate::runtime::config::CoreConfig;

/// Manager used by `nativeAllocate` / `nativeFree`, whose signatures carry
/// no engine handle. Points at the most recently created engine.
static ALLOCATION_MANAGER: RwLock<Option<Arc<VoidManager>>> = const_rwlock(None);

/// Everything behind one engine handle
pub struct EngineInstance {
    context: HeadlessContext,
    callbacks: Arc<CallbackHandler>,
    engine: RwLock<HeadlessEngine>,
}

impl EngineInstance {
    /// Build a manager, asset cache, callback workers and engine from
    /// JSON config bytes
    pub fn create(config: &[u8]) -> VoidResult<Self> {
        let core = CoreConfig::from_bytes(config)?;
        let manager = VoidManager::new(&core.memory);
        let assets = AssetCache::new(manager.clone());
        let callbacks = CallbackHandler::new(core.callback_threads)?;

        let sink = callbacks.clone();
        manager.set_warning_callback(move |warning| sink.send_memory_warning(warning));

        let context = HeadlessContext::new(manager, assets);
        let engine = HeadlessEngine::create(&context, config)?;

        Ok(Self {
            context,
            callbacks,
            engine: RwLock::new(engine),
        })
    }

    pub fn manager(&self) -> &Arc<VoidManager> {
        &self.context.manager
    }

    /// Shut everything down; the instance is unusable afterwards
    pub fn teardown(self) {
        let Self {
            context,
            callbacks,
            engine,
        } = self;

        let mut engine = engine.into_inner();
        if engine.is_initialized() {
            engine.shutdown();
        }
        engine.destroy();

        callbacks.shutdown();
        context.assets.clear();
        context.manager.clear_warning_callback();
        context.manager.shutdown();
    }
}

unsafe fn instance<'a>(handle: jlong) -> Option<&'a EngineInstance> {
    (handle as *const EngineInstance).as_ref()
}

// ============================================================================
// LIFECYCLE FUNCTIONS
// ============================================================================

/// Create the native engine instance
#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeCreateEngine(
    env: JNIEnv,
    _class: JClass,
    config: JByteArray,
) -> jlong {
    crate::init_logging();
    log::info!("JNI: nativeCreateEngine called");

    let config_bytes = match env.convert_byte_array(config) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Failed to read config bytes: {}", e);
            return 0;
        }
    };

    match EngineInstance::create(&config_bytes) {
        Ok(instance) => {
            *ALLOCATION_MANAGER.write() = Some(instance.manager().clone());
            let ptr = Box::into_raw(Box::new(instance));
            log::info!("Engine created at {:p}", ptr);
            ptr as jlong
        }
        Err(e) => {
            log::error!("Failed to create engine: {}", e);
            0
        }
    }
}

/// Destroy the native engine instance
#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeDestroyEngine(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    let ptr = handle as *mut EngineInstance;
    if ptr.is_null() {
        return;
    }

    let instance = Box::from_raw(ptr);
    {
        let mut global = ALLOCATION_MANAGER.write();
        if global.as_ref().is_some_and(|m| Arc::ptr_eq(m, instance.manager())) {
            *global = None;
        }
    }
    instance.teardown();
    log::info!("Engine destroyed");
}

/// Initialize the native engine
#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeInitialize(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    hardware_info: JByteArray,
    gpu_caps: JByteArray,
    config: JByteArray,
) -> jboolean {
    let Some(instance) = instance(handle) else {
        return to_jboolean(false);
    };

    log::info!("JNI: nativeInitialize called");

    let read = |array: JByteArray| {
        if array.is_null() {
            Vec::new()
        } else {
            env.convert_byte_array(array).unwrap_or_default()
        }
    };
    let hardware_info = read(hardware_info);
    let gpu_caps = read(gpu_caps);
    let config = read(config);

    match instance.engine.write().initialize(&hardware_info, &gpu_caps, &config) {
        Ok(()) => to_jboolean(true),
        Err(e) => {
            log::error!("Engine initialization failed: {}", e);
            to_jboolean(false)
        }
    }
}

/// Shutdown the native engine
#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeShutdown(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.write().shutdown();
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativePause(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().pause();
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeResume(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().resume();
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeGetVersion<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> JString<'local> {
    env.new_string(catalog::version())
        .unwrap_or_else(|_| JString::from(JObject::null()))
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeGetBuildTime(
    _env: JNIEnv,
    _class: JClass,
) -> jlong {
    catalog::build_time()
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeGetApiVersion(
    _env: JNIEnv,
    _class: JClass,
) -> jint {
    catalog::API_VERSION
}

// ============================================================================
// TICK FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeOnTick(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    tick: jlong,
    delta_time: jfloat,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().on_tick(tick, delta_time);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativePrepareFrame(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    partial_ticks: jfloat,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().prepare_frame(partial_ticks);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeRenderWorld(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    frame: jlong,
    partial_ticks: jfloat,
    view_matrix: JObject,
    proj_matrix: JObject,
) {
    let Some(instance) = instance(handle) else {
        return;
    };

    let view: &[f32] = direct_object_slice(&env, view_matrix).unwrap_or(&[]);
    let projection: &[f32] = direct_object_slice(&env, proj_matrix).unwrap_or(&[]);
    instance.engine.read().render_world(frame, partial_ticks, view, projection);
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeCompositeFrame(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().composite_frame();
    }
}

// ============================================================================
// MEMORY FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeAllocate(
    _env: JNIEnv,
    _class: JClass,
    size: jlong,
) -> jlong {
    if size <= 0 {
        return 0;
    }

    let manager = ALLOCATION_MANAGER.read().clone();
    let Some(manager) = manager else {
        log::error!("nativeAllocate called before any engine was created");
        return 0;
    };

    match manager.allocate(size as usize, crate::bridge::headless::NATIVE_TAG) {
        Ok(address) => address as jlong,
        Err(e) => {
            log::error!("Native allocation of {} bytes failed: {}", size, e);
            0
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeFree(
    _env: JNIEnv,
    _class: JClass,
    pointer: jlong,
) {
    if pointer == 0 {
        return;
    }
    if let Some(manager) = ALLOCATION_MANAGER.read().clone() {
        // Unknown addresses are logged by the manager
        let _ = manager.free(pointer as usize);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeSyncMemory(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().sync_memory();
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeGetMemoryUsage(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jlong {
    instance(handle)
        .map(|instance| instance.engine.read().memory_usage() as jlong)
        .unwrap_or(0)
}

// ============================================================================
// ENTITY FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeSpawnEntity(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    entity_id: jint,
    entity_type: JString,
    x: jdouble,
    y: jdouble,
    z: jdouble,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    let kind = java_string(&mut env, &entity_type).unwrap_or_default();
    instance.engine.read().spawn_entity(entity_id, &kind, x, y, z);
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeRemoveEntity(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    entity_id: jint,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().remove_entity(entity_id);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeUpdateEntity(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    entity_id: jint,
    x: jdouble,
    y: jdouble,
    z: jdouble,
    yaw: jfloat,
    pitch: jfloat,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().update_entity(entity_id, x, y, z, yaw, pitch);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeBatchUpdateEntities(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    entity_ids: JObject,
    positions: JObject,
    count: jint,
) {
    let Some(instance) = instance(handle) else {
        return;
    };

    let ids: &[i32] = direct_object_slice(&env, entity_ids).unwrap_or(&[]);
    let positions: &[f32] = direct_object_slice(&env, positions).unwrap_or(&[]);
    let count = usize::try_from(count).unwrap_or(0);

    if ids.len() < count || positions.len() < count * 5 {
        log::warn!(
            "Batch update of {} entities with {} ids and {} position values",
            count,
            ids.len(),
            positions.len()
        );
        return;
    }

    instance
        .engine
        .read()
        .batch_update_entities(&ids[..count], &positions[..count * 5]);
}

// ============================================================================
// CHUNK FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeLoadChunk(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    x: jint,
    z: jint,
    data: JByteBuffer,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    if let Some(bytes) = direct_bytes(&env, &data) {
        instance.engine.read().load_chunk(x, z, bytes);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeUnloadChunk(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    x: jint,
    z: jint,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().unload_chunk(x, z);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeUpdateChunk(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    x: jint,
    z: jint,
    data: JByteBuffer,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    if let Some(bytes) = direct_bytes(&env, &data) {
        instance.engine.read().update_chunk(x, z, bytes);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeMarkChunkDirty(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    x: jint,
    z: jint,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().mark_chunk_dirty(x, z);
    }
}

// ============================================================================
// TEXTURE FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeUploadTexture(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    name: JString,
    data: JByteBuffer,
    width: jint,
    height: jint,
    format: jint,
) -> jlong {
    let Some(instance) = instance(handle) else {
        return 0;
    };
    let Some(name) = java_string(&mut env, &name) else {
        return 0;
    };
    let Some(bytes) = direct_bytes(&env, &data) else {
        return 0;
    };

    instance
        .engine
        .read()
        .upload_texture(&name, bytes, width, height, format) as jlong
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeUnloadTexture(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    texture_handle: jlong,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().unload_texture(texture_handle as u64);
    }
}

// ============================================================================
// AUDIO FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativePlaySound(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    sound: JString,
    x: jfloat,
    y: jfloat,
    z: jfloat,
    volume: jfloat,
    pitch: jfloat,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    if let Some(sound) = java_string(&mut env, &sound) {
        instance.engine.read().play_sound(&sound, x, y, z, volume, pitch);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeStopSound(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    sound: JString,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    if let Some(sound) = java_string(&mut env, &sound) {
        instance.engine.read().stop_sound(&sound);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeUpdateListener(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    x: jfloat,
    y: jfloat,
    z: jfloat,
    yaw: jfloat,
    pitch: jfloat,
) {
    if let Some(instance) = instance(handle) {
        instance.engine.read().update_listener(x, y, z, yaw, pitch);
    }
}

// ============================================================================
// NETWORK FUNCTIONS
// ============================================================================

unsafe fn transform_packet<'local>(
    env: &JNIEnv<'local>,
    handle: jlong,
    data: JByteArray,
    f: impl FnOnce(&HeadlessEngine, &[u8]) -> VoidResult<Vec<u8>>,
) -> JByteArray<'local> {
    let Some(instance) = instance(handle) else {
        return JByteArray::default();
    };

    let input = match env.convert_byte_array(data) {
        Ok(bytes) => bytes,
        Err(_) => return JByteArray::default(),
    };

    let output = match f(&*instance.engine.read(), &input) {
        Ok(output) => output,
        Err(e) => {
            log::warn!("Packet transform failed: {}", e);
            return JByteArray::default();
        }
    };

    env.byte_array_from_slice(&output).unwrap_or_default()
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeCompressPacket<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    data: JByteArray,
) -> JByteArray<'local> {
    transform_packet(&env, handle, data, |engine, input| engine.compress_packet(input))
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeDecompressPacket<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    data: JByteArray,
) -> JByteArray<'local> {
    transform_packet(&env, handle, data, |engine, input| engine.decompress_packet(input))
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativePredictState(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    tick: jlong,
    state: JByteBuffer,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    if let Some(bytes) = direct_bytes(&env, &state) {
        instance.engine.read().predict_state(tick, bytes);
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeReconcileState(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    tick: jlong,
    server_state: JByteBuffer,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    if let Some(bytes) = direct_bytes(&env, &server_state) {
        instance.engine.read().reconcile_state(tick, bytes);
    }
}

// ============================================================================
// DEBUG FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeGetDebugInfo<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> JString<'local> {
    let info = match instance(handle) {
        Some(instance) => instance.engine.read().debug_info(),
        None => "Engine not initialized".to_string(),
    };

    env.new_string(&info)
        .unwrap_or_else(|_| JString::from(JObject::null()))
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeSetDebugFlag(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    flag: JString,
    value: jboolean,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    if let Some(flag) = java_string(&mut env, &flag) {
        instance.engine.read().set_debug_flag(&flag, from_jboolean(value));
    }
}

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeGetProfileData(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jlong {
    instance(handle)
        .map(|instance| instance.engine.read().profile_data() as jlong)
        .unwrap_or(0)
}

// ============================================================================
// CALLBACK FUNCTIONS
// ============================================================================

#[no_mangle]
pub unsafe extern "system" fn Java_dev_libs_bridge_NativeBridge_nativeRegisterCallbacks(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    callback_handler: JObject,
) {
    log::info!("JNI: nativeRegisterCallbacks called");

    let Some(instance) = instance(handle) else {
        return;
    };
    if callback_handler.is_null() {
        log::warn!("Null callback handler, keeping default handlers");
        return;
    }

    match super::callback::register(&mut env, &instance.callbacks, callback_handler) {
        Ok(()) => {
            instance.engine.read().register_callbacks(instance.callbacks.clone());
            log::info!("JNI callbacks registered successfully");
        }
        Err(e) => log::error!("Failed to register callbacks: {}", e),
    }
}
