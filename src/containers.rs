//! Generally useful container data structures

pub mod unordered {
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseMap<K, V> = std::collections::HashMap<K, V>;
    #[cfg(feature = "deterministic_containers")]
    type BaseMap<K, V> = std::collections::BTreeMap<K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseSet<T> = std::collections::HashSet<T>;
    #[cfg(feature = "deterministic_containers")]
    type BaseSet<T> = std::collections::BTreeSet<T>;

    /// A map whose iteration order carries no meaning. The crate's features decide whether it is
    /// backed by a hash map or (for reproducible register dumps and operator listings) a B-tree.
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedMap<K: std::hash::Hash + Ord + Eq, V> {
        map: BaseMap<K, V>,
    }

    impl<K: std::hash::Hash + Ord + Eq, V> UnorderedMap<K, V> {
        pub fn new() -> Self {
            Self {
                map: Default::default(),
            }
        }

        pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
            self.map.iter()
        }

        pub fn keys(&self) -> impl Iterator<Item = &K> {
            self.map.keys()
        }

        pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> bool
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.contains_key(k)
        }

        pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get(k)
        }

        pub fn get_mut<Q: ?Sized>(&mut self, k: &Q) -> Option<&mut V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get_mut(k)
        }

        /// Inserts a key-value pair, returning the previous value at `k` if there was one.
        pub fn insert(&mut self, k: K, v: V) -> Option<V> {
            self.map.insert(k, v)
        }

        pub fn len(&self) -> usize {
            self.map.len()
        }

        pub fn is_empty(&self) -> bool {
            self.map.is_empty()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> Default for UnorderedMap<K, V> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> FromIterator<(K, V)> for UnorderedMap<K, V> {
        fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
            Self {
                map: BaseMap::from_iter(iter),
            }
        }
    }

    impl<K, Q: ?Sized, V> std::ops::Index<&Q> for UnorderedMap<K, V>
    where
        K: std::borrow::Borrow<Q> + std::hash::Hash + Ord + Eq,
        Q: std::hash::Hash + Ord + Eq,
    {
        type Output = V;

        /// Panics if `k` is absent
        fn index(&self, k: &Q) -> &V {
            &self.map[k]
        }
    }

    impl<K: std::hash::Hash + Ord + Eq + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug
        for UnorderedMap<K, V>
    {
        // Always ordered, so that debug output can be diffed across runs
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.map
                .iter()
                .collect::<std::collections::BTreeMap<_, _>>()
                .fmt(f)
        }
    }

    /// A set whose iteration order carries no meaning. See [`UnorderedMap`].
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedSet<T: std::hash::Hash + Ord + Eq> {
        set: BaseSet<T>,
    }

    impl<T: std::hash::Hash + Ord + Eq> UnorderedSet<T> {
        pub fn new() -> Self {
            Self {
                set: BaseSet::new(),
            }
        }

        /// Adds a value to the set, returning whether it was newly inserted.
        pub fn insert(&mut self, value: T) -> bool {
            self.set.insert(value)
        }

        pub fn contains<Q: ?Sized>(&self, value: &Q) -> bool
        where
            T: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.set.contains(value)
        }

        pub fn len(&self) -> usize {
            self.set.len()
        }

        pub fn is_empty(&self) -> bool {
            self.set.is_empty()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> Default for UnorderedSet<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq + std::fmt::Debug> std::fmt::Debug for UnorderedSet<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.set
                .iter()
                .collect::<std::collections::BTreeSet<_>>()
                .fmt(f)
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> FromIterator<T> for UnorderedSet<T> {
        fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
            Self {
                set: BaseSet::from_iter(iter),
            }
        }
    }

}
