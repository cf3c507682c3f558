//! Post persistence seam. The host supplies the durable implementation.

use std::collections::BTreeMap;

use crate::protocol::Post;

/// Store/retrieve/delete posts by id.
pub trait PostStore: Send {
    fn get(&self, id: &str) -> Option<Post>;
    /// Insert or replace.
    fn put(&mut self, post: Post);
    /// Returns whether a post was removed.
    fn delete(&mut self, id: &str) -> bool;
    /// All posts, newest first.
    fn all(&self) -> Vec<Post>;
}

/// In-process store. Used by tests and when no post file is configured.
#[derive(Debug, Default, Clone)]
pub struct MemoryPostStore {
    posts: BTreeMap<String, Post>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_posts(posts: impl IntoIterator<Item = Post>) -> Self {
        Self {
            posts: posts.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}

impl PostStore for MemoryPostStore {
    fn get(&self, id: &str) -> Option<Post> {
        self.posts.get(id).cloned()
    }

    fn put(&mut self, post: Post) {
        self.posts.insert(post.id.clone(), post);
    }

    fn delete(&mut self, id: &str) -> bool {
        self.posts.remove(id).is_some()
    }

    fn all(&self) -> Vec<Post> {
        sort_newest_first(self.posts.values().cloned().collect())
    }
}

/// Newest first; ties broken by id so the order is stable.
pub fn sort_newest_first(mut posts: Vec<Post>) -> Vec<Post> {
    posts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
    posts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str, ts: &str) -> Post {
        Post {
            id: id.into(),
            content: format!("content {id}"),
            sender: "s".into(),
            timestamp: ts.parse().unwrap(),
        }
    }

    #[test]
    fn put_get_delete() {
        let mut store = MemoryPostStore::new();
        store.put(post("a", "2024-01-01T00:00:00Z"));
        assert_eq!(store.get("a").unwrap().content, "content a");
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn all_is_newest_first() {
        let store = MemoryPostStore::from_posts([
            post("old", "2024-01-01T00:00:00Z"),
            post("new", "2024-03-01T00:00:00Z"),
            post("mid", "2024-02-01T00:00:00Z"),
        ]);
        let ids: Vec<_> = store.all().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }
}
