//! A directory of Markdown files as a page hierarchy.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use datalib_shared::{DatalibError, Entity, EntityKind, EntitySource, Result};
use datalib_stream::{FileVisitor, VisitorEvent};

use crate::converter::{MarkdownConverter, PassthroughConverter};
use crate::frontmatter::split_front_matter;
use crate::title::{first_heading, slug_to_title, strip_leading_heading};

/// Checkpoint of a [`MarkdownTreeReader`]: how many pages were handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkdownCursor {
    pub entities_read: u64,
}

/// The page standing in for a directory.
#[derive(Debug)]
enum DirectoryPage {
    Index(PathBuf),
    Placeholder(PathBuf),
}

/// Everything needed to build a page entity, known before any file is read.
#[derive(Debug)]
struct PagePlan {
    post_id: u64,
    parent_id: Option<u64>,
    /// File or directory the page comes from.
    path: PathBuf,
    /// The Markdown file to read; `None` for directory placeholders.
    file: Option<PathBuf>,
    /// Name `slug_to_title` falls back to.
    title_source: String,
}

/// Walks a directory tree and yields one `post` entity per page.
///
/// Every directory below the root becomes a page: its first Markdown file
/// with `index` in the name, or an empty placeholder. The directory's other
/// Markdown files are parented to that page. Files directly in the root are
/// top-level pages.
pub struct MarkdownTreeReader<C: MarkdownConverter = PassthroughConverter> {
    root: PathBuf,
    converter: C,
    first_post_id: u64,
    visitor: FileVisitor,
    pending_directory: Option<DirectoryPage>,
    pending_files: VecDeque<PathBuf>,
    depth: usize,
    /// Page id of the directory at each depth of the current walk position.
    parent_ids: Vec<Option<u64>>,
    entities_read: u64,
}

impl MarkdownTreeReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_converter(root, PassthroughConverter)
    }
}

impl<C: MarkdownConverter> MarkdownTreeReader<C> {
    pub fn with_converter(root: impl Into<PathBuf>, converter: C) -> Self {
        let root = root.into();
        Self {
            visitor: FileVisitor::new(root.clone()),
            root,
            converter,
            first_post_id: 1,
            pending_directory: None,
            pending_files: VecDeque::new(),
            depth: 0,
            parent_ids: Vec::new(),
            entities_read: 0,
        }
    }

    /// Number the pages starting at `id` instead of 1.
    pub fn with_first_post_id(mut self, id: u64) -> Self {
        self.first_post_id = id;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entities_read(&self) -> u64 {
        self.entities_read
    }

    fn restart(&mut self) {
        self.visitor = FileVisitor::new(self.root.clone());
        self.pending_directory = None;
        self.pending_files.clear();
        self.depth = 0;
        self.parent_ids.clear();
        self.entities_read = 0;
    }

    fn allocate(&mut self) -> u64 {
        let id = self.first_post_id + self.entities_read;
        self.entities_read += 1;
        id
    }

    /// Advance the walk to the next page without reading it.
    fn next_plan(&mut self) -> Result<Option<PagePlan>> {
        loop {
            if let Some(directory) = self.pending_directory.take() {
                let parent_id = self
                    .depth
                    .checked_sub(1)
                    .and_then(|d| self.parent_ids.get(d).copied().flatten());
                let post_id = self.allocate();
                self.parent_ids[self.depth] = Some(post_id);

                let (path, file) = match directory {
                    DirectoryPage::Index(file) => {
                        let dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
                        (dir, Some(file))
                    }
                    DirectoryPage::Placeholder(dir) => (dir, None),
                };
                let title_source = file_name(&path);
                let path = file.clone().unwrap_or(path);
                return Ok(Some(PagePlan {
                    post_id,
                    parent_id,
                    path,
                    file,
                    title_source,
                }));
            }

            if let Some(file) = self.pending_files.pop_front() {
                let parent_id = self.parent_ids.get(self.depth).copied().flatten();
                return Ok(Some(PagePlan {
                    post_id: self.allocate(),
                    parent_id,
                    title_source: file_name(&file),
                    path: file.clone(),
                    file: Some(file),
                }));
            }

            let Some(event) = self.visitor.next() else {
                return Ok(None);
            };
            match event? {
                VisitorEvent::Enter { dir, files, depth } => {
                    self.depth = depth;
                    self.parent_ids.truncate(depth);
                    self.parent_ids.resize(depth + 1, None);

                    let mut pages: VecDeque<PathBuf> =
                        files.into_iter().filter(|f| is_markdown(f)).collect();
                    if depth > 0 {
                        let index = pages.iter().position(|f| is_index(f));
                        self.pending_directory = Some(match index.and_then(|i| pages.remove(i)) {
                            Some(file) => DirectoryPage::Index(file),
                            None => DirectoryPage::Placeholder(dir),
                        });
                    }
                    self.pending_files = pages;
                }
                VisitorEvent::Exit { depth, .. } => {
                    self.parent_ids.truncate(depth);
                }
            }
        }
    }

    fn build(&self, plan: PagePlan) -> Result<Entity> {
        let markdown = match &plan.file {
            Some(file) => std::fs::read_to_string(file).map_err(|e| DatalibError::io(file, e))?,
            None => String::new(),
        };
        let (front, body) = split_front_matter(&markdown);
        let heading = first_heading(body);
        let content = self.converter.convert(strip_leading_heading(body))?;

        let title = front
            .non_empty("title")
            .map(str::to_string)
            .or(heading)
            .unwrap_or_else(|| slug_to_title(&plan.title_source));
        let relative = relative_path(&self.root, &plan.path);

        debug!(post_id = plan.post_id, path = %relative, title = %title, "markdown page");

        let mut entity = Entity::new(EntityKind::Post)
            .with_field("post_id", plan.post_id.to_string())
            .with_field("post_type", "page")
            .with_field("guid", relative.clone())
            .with_field("post_title", title)
            .with_field("post_content", content)
            .with_field("post_excerpt", front.get("description").unwrap_or_default())
            .with_field("post_status", "publish")
            .with_field("source_path", relative)
            .with_field(
                "post_parent",
                plan.parent_id.map(|id| id.to_string()).unwrap_or_else(|| "0".into()),
            );
        if let Some(slug) = front.non_empty("slug") {
            let name = slug.trim_end_matches('/').rsplit('/').next().unwrap_or(slug);
            entity.set("post_name", name);
        }
        if let Some(position) = front.non_empty("sidebar_position") {
            entity.set("menu_order", position);
        }
        Ok(entity)
    }
}

impl<C: MarkdownConverter> EntitySource for MarkdownTreeReader<C> {
    type Cursor = MarkdownCursor;

    fn next_entity(&mut self) -> Result<Option<Entity>> {
        match self.next_plan()? {
            Some(plan) => self.build(plan).map(Some),
            None => Ok(None),
        }
    }

    fn pause(&self) -> Result<MarkdownCursor> {
        Ok(MarkdownCursor {
            entities_read: self.entities_read,
        })
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn resume(&mut self, cursor: &MarkdownCursor) -> Result<()> {
        self.restart();
        while self.entities_read < cursor.entities_read {
            if self.next_plan()?.is_none() {
                return Err(DatalibError::cursor(format!(
                    "cursor expects {} pages but {} has only {}",
                    cursor.entities_read,
                    self.root.display(),
                    self.entities_read
                )));
            }
        }
        Ok(())
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

fn is_index(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_ascii_lowercase().contains("index"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `root`-relative path with `/` separators.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
