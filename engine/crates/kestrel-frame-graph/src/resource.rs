//! 命名资源包
//!
//! 一组按 key 索引的缓冲区 / 图像描述，数据来源可以是字节、共享引用、
//! 文件路径或延迟回调。编译一次（上传到设备）后只读；任意数量的 Queue
//! 可以引用它。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kestrel_gfx::image_info::{GfxBufferInfo, GfxImageInfo};

/// 资源数据来源
pub enum FgResourceData {
    /// 拷贝进资源的字节
    Bytes(Vec<u8>),
    /// 非拥有的共享引用，调用方保证存活
    Shared(Arc<[u8]>),
    /// 构建期解析的文件路径
    Path(PathBuf),
    /// 编译期调用的回调
    Deferred(Box<dyn Fn() -> Option<Vec<u8>> + Send>),
}

/// 资源归属
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FgResourceOwnership {
    /// 恰好归一个 Queue 所有
    Internal,
    /// 共享；链接前必须已编译
    Linked,
}

/// 缓冲区条目
pub struct FgBufferEntry {
    pub info: GfxBufferInfo,
    pub data: FgResourceData,
    /// 构建期确定的字节数
    pub resolved_size: u64,
}

/// 图像条目
pub struct FgImageEntry {
    pub info: GfxImageInfo,
    pub data: FgResourceData,
}

/// 命名资源包
pub struct FgResource {
    name: String,
    buffers: HashMap<String, FgBufferEntry>,
    images: HashMap<String, FgImageEntry>,
    ownership: FgResourceOwnership,
    compiled: bool,
}

// new & init
impl FgResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            ownership: FgResourceOwnership::Internal,
            compiled: false,
        }
    }

    #[inline]
    pub fn with_ownership(mut self, ownership: FgResourceOwnership) -> Self {
        self.ownership = ownership;
        self
    }
}

// 注册
impl FgResource {
    /// 添加缓冲区
    ///
    /// 重复 key、编译后添加、找不到文件都返回 false 并记录错误。
    pub fn add_buffer(&mut self, key: impl Into<String>, info: GfxBufferInfo, data: FgResourceData) -> bool {
        let key = key.into();
        if !self.check_addable(&key) || self.buffers.contains_key(&key) {
            if self.buffers.contains_key(&key) {
                log::error!("FgResource[{}]: duplicate buffer key '{}'", self.name, key);
            }
            return false;
        }

        let resolved_size = match Self::resolve_size(&data) {
            Some(size) => size,
            None => {
                log::error!("FgResource[{}]: cannot resolve data for buffer '{}'", self.name, key);
                return false;
            }
        };

        self.buffers.insert(key, FgBufferEntry { info, data, resolved_size });
        true
    }

    /// 添加图像
    ///
    /// 文件路径在构建期解析并探测尺寸，编译时无需重读。
    pub fn add_image(&mut self, key: impl Into<String>, mut info: GfxImageInfo, data: FgResourceData) -> bool {
        let key = key.into();
        if !self.check_addable(&key) || self.images.contains_key(&key) {
            if self.images.contains_key(&key) {
                log::error!("FgResource[{}]: duplicate image key '{}'", self.name, key);
            }
            return false;
        }

        let data = match data {
            FgResourceData::Path(path) => {
                let Some(path) = Self::resolve_path(&path) else {
                    log::error!("FgResource[{}]: image file not found for '{}'", self.name, key);
                    return false;
                };
                // 构建期探测图像尺寸
                match image::image_dimensions(&path) {
                    Ok((width, height)) => {
                        info.width = width;
                        info.height = height;
                    }
                    Err(err) => {
                        log::error!("FgResource[{}]: cannot probe image '{}': {}", self.name, key, err);
                        return false;
                    }
                }
                FgResourceData::Path(path)
            }
            other => other,
        };

        self.images.insert(key, FgImageEntry { info, data });
        true
    }

    fn check_addable(&self, key: &str) -> bool {
        if self.compiled {
            log::error!("FgResource[{}]: add '{}' after compilation", self.name, key);
            return false;
        }
        true
    }

    fn resolve_size(data: &FgResourceData) -> Option<u64> {
        match data {
            FgResourceData::Bytes(bytes) => Some(bytes.len() as u64),
            FgResourceData::Shared(bytes) => Some(bytes.len() as u64),
            FgResourceData::Path(path) => {
                let path = Self::resolve_path(path)?;
                std::fs::metadata(path).ok().map(|m| m.len())
            }
            // 延迟数据的大小在编译期才能确定
            FgResourceData::Deferred(_) => Some(0),
        }
    }

    /// 绝对路径或相对 cwd 的路径
    fn resolve_path(path: &Path) -> Option<PathBuf> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().ok()?.join(path)
        };
        resolved.exists().then_some(resolved)
    }
}

// 编译
impl FgResource {
    /// 编译资源包：触发全部延迟回调，之后包只读
    ///
    /// 失败（某个回调返回 None）会记录错误并返回 false，包保持未编译。
    pub fn compile(&mut self) -> bool {
        if self.compiled {
            return true;
        }

        for (key, entry) in &mut self.buffers {
            if let FgResourceData::Deferred(cb) = &entry.data {
                match cb() {
                    Some(bytes) => {
                        entry.resolved_size = bytes.len() as u64;
                        entry.data = FgResourceData::Bytes(bytes);
                    }
                    None => {
                        log::error!("FgResource[{}]: deferred buffer '{}' returned no data", self.name, key);
                        return false;
                    }
                }
            }
        }
        for (key, entry) in &mut self.images {
            if let FgResourceData::Deferred(cb) = &entry.data {
                match cb() {
                    Some(bytes) => entry.data = FgResourceData::Bytes(bytes),
                    None => {
                        log::error!("FgResource[{}]: deferred image '{}' returned no data", self.name, key);
                        return false;
                    }
                }
            }
        }

        self.compiled = true;
        true
    }
}

// getters
impl FgResource {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn ownership(&self) -> FgResourceOwnership {
        self.ownership
    }

    #[inline]
    pub fn compiled(&self) -> bool {
        self.compiled
    }

    #[inline]
    pub fn get_buffer(&self, key: &str) -> Option<&FgBufferEntry> {
        self.buffers.get(key)
    }

    #[inline]
    pub fn get_image(&self, key: &str) -> Option<&FgImageEntry> {
        self.images.get(key)
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}
