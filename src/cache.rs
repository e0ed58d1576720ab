// 该文件是 Xunying （寻影） 项目的一部分。
// src/cache.rs - 有界缓存
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::config::DetectorConfig;
use crate::embedding::RegionSet;
use crate::hash::{ImageHash, TrainingDataHash};
use crate::prototype::ClassPrototypeSet;

/// 缓存中只存放完整构造的值，锁中毒时可以直接取回内部数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CacheInner<K, V> {
  order: VecDeque<K>,
  entries: HashMap<K, V>,
}

/// 固定容量的键值缓存，超出容量时淘汰最早插入的条目（FIFO，读取不会刷新位置）
pub struct BoundedCache<K, V> {
  capacity: usize,
  inner: Mutex<CacheInner<K, V>>,
}

impl<K, V> BoundedCache<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      inner: Mutex::new(CacheInner {
        order: VecDeque::with_capacity(capacity.min(1024)),
        entries: HashMap::new(),
      }),
    }
  }

  /// `None` 表示键不存在；存放的值本身可以是任意类型（包括 `Option`）
  pub fn get(&self, key: &K) -> Option<V> {
    lock(&self.inner).entries.get(key).cloned()
  }

  pub fn contains(&self, key: &K) -> bool {
    lock(&self.inner).entries.contains_key(key)
  }

  /// 插入或覆盖。覆盖已有键时保持其原插入位置。
  pub fn insert(&self, key: K, value: V) {
    let mut inner = lock(&self.inner);
    if let Some(slot) = inner.entries.get_mut(&key) {
      *slot = value;
      return;
    }

    inner.order.push_back(key.clone());
    inner.entries.insert(key, value);

    while inner.entries.len() > self.capacity {
      let Some(oldest) = inner.order.pop_front() else {
        break;
      };
      inner.entries.remove(&oldest);
      debug!("缓存已满 (容量 {}), 淘汰最早的条目", self.capacity);
    }
  }

  pub fn len(&self) -> usize {
    lock(&self.inner).entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn clear(&self) {
    let mut inner = lock(&self.inner);
    inner.order.clear();
    inner.entries.clear();
  }
}

/// 按键串行化计算：同一个键同时只有一个计算在进行，后到者等待而不是重复计算
pub struct InFlight<K> {
  slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for InFlight<K> {
  fn default() -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
    }
  }
}

impl<K: Eq + Hash + Clone> InFlight<K> {
  /// 在该键的独占区内执行 `f`。`f` 内应当再次检查缓存。
  pub fn run<T>(&self, key: &K, f: impl FnOnce() -> T) -> T {
    let slot = lock(&self.slots).entry(key.clone()).or_default().clone();

    let result = {
      let _guard = lock(&slot);
      f()
    };

    let mut slots = lock(&self.slots);
    // 表中一份加上本地一份，说明没有其他等待者
    if slots
      .get(key)
      .is_some_and(|current| Arc::ptr_eq(current, &slot) && Arc::strong_count(&slot) == 2)
    {
      slots.remove(key);
    }
    result
  }

  pub fn pending(&self) -> usize {
    lock(&self.slots).len()
  }
}

/// 一代缓存。重置时整体替换，正在进行的操作始终只看到同一代的数据。
pub struct Caches {
  pub image_embeds: BoundedCache<ImageHash, Arc<RegionSet>>,
  pub image_sizes: BoundedCache<ImageHash, (u32, u32)>,
  pub class_embeddings: BoundedCache<TrainingDataHash, Arc<ClassPrototypeSet>>,
  pub(crate) embedding_flights: InFlight<ImageHash>,
  pub(crate) training_flights: InFlight<TrainingDataHash>,
}

impl Caches {
  pub fn new(config: &DetectorConfig) -> Self {
    Self {
      image_embeds: BoundedCache::new(config.image_embed_cache_size),
      image_sizes: BoundedCache::new(config.image_size_cache_size),
      class_embeddings: BoundedCache::new(config.class_embeddings_cache_size),
      embedding_flights: InFlight::default(),
      training_flights: InFlight::default(),
    }
  }
}
