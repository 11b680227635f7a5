use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use tracing::debug;

use crate::classfile::{read_class, ClassDef};
use crate::GeneralResult;

/// Where class definitions come from. `load` returns `Ok(None)` when no
/// location has the class, and an error when one does but it cannot be read.
pub trait ClassSource {
    fn load(&self, name : &str) -> GeneralResult<Option<ClassDef>>;
}

/// Class files found on disk: directories of `.class` files and jar archives.
#[derive(Debug, Default)]
pub struct ClassPath {
    entries : Vec<PathBuf>,
    stub_prefix : Option<String>,
    /// jars are indexed on first use and kept open
    archives : RefCell<BTreeMap<PathBuf, ZipArchive<File>>>,
}

/// Splits every line of a `classpath` file into path entries.
pub fn read_classpath_file(path : &Path) -> GeneralResult<Vec<PathBuf>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().flat_map(split_classpath).collect())
}

pub fn split_classpath(list : &str) -> Vec<PathBuf> {
    std::env::split_paths(list.trim())
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

impl ClassPath {
    fn read_from_jar(&self, jar : &Path, entry : &str) -> GeneralResult<Option<Vec<u8>>> {
        let mut archives = self.archives.borrow_mut();
        let zip = match archives.entry(jar.to_owned()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                debug!(jar = %jar.display(), "indexing archive");
                e.insert(ZipArchive::new(File::open(jar)?)?)
            },
        };
        let result = match zip.by_name(entry) {
            Ok(mut f) => {
                let mut buf = Vec::with_capacity(f.size() as usize);
                f.read_to_end(&mut buf)?;
                Ok(Some(buf))
            },
            Err(zip::result::ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        };
        result
    }

    pub fn new(entries : Vec<PathBuf>, stub_prefix : Option<String>) -> Self {
        ClassPath { entries, stub_prefix, archives : RefCell::default() }
    }

    /// Builds the full search order: explicit paths, then the `classpath` file
    /// in the working directory, then `CLASSPATH`, then the runtime jars under
    /// `JAVA_HOME`.
    pub fn from_environment(search : &[PathBuf], stub_prefix : Option<String>) -> GeneralResult<Self> {
        let mut entries = search.to_vec();

        let file = Path::new("classpath");
        if file.is_file() {
            entries.extend(read_classpath_file(file)?);
        }
        if let Ok(cp) = std::env::var("CLASSPATH") {
            entries.extend(split_classpath(&cp));
        }
        if let Ok(home) = std::env::var("JAVA_HOME") {
            let home = PathBuf::from(home);
            entries.push(home.join("jre").join("lib").join("rt.jar"));
            entries.push(home.join("lib").join("rt.jar"));
        }

        Ok(ClassPath::new(entries, stub_prefix))
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn read_bytes(&self, name : &str) -> GeneralResult<Option<Vec<u8>>> {
        let relative = format!("{}.class", name);
        for entry in &self.entries {
            if entry.is_file() {
                if let Some(bytes) = self.read_from_jar(entry, &relative)? {
                    debug!(class = name, jar = %entry.display(), "found class in archive");
                    return Ok(Some(bytes));
                }
            } else {
                let path = entry.join(&relative);
                if path.is_file() {
                    debug!(class = name, path = %path.display(), "found class file");
                    return Ok(Some(std::fs::read(path)?));
                }
            }
        }
        Ok(None)
    }
}

impl ClassSource for ClassPath {
    fn load(&self, name : &str) -> GeneralResult<Option<ClassDef>> {
        match self.read_bytes(name)? {
            Some(bytes) => Ok(Some(read_class(&bytes, self.stub_prefix.as_deref())?)),
            None => Ok(None),
        }
    }
}

/// Classes held in memory, keyed by the name they are requested under.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    classes : BTreeMap<String, ClassDef>,
}

impl MemorySource {
    pub fn new() -> Self { Default::default() }

    pub fn insert(&mut self, class : ClassDef) -> &mut Self {
        self.classes.insert(class.name.clone(), class);
        self
    }

    pub fn insert_as(&mut self, name : &str, class : ClassDef) -> &mut Self {
        self.classes.insert(name.to_owned(), class);
        self
    }
}

impl ClassSource for MemorySource {
    fn load(&self, name : &str) -> GeneralResult<Option<ClassDef>> {
        Ok(self.classes.get(name).cloned())
    }
}

#[cfg(test)]
fn scratch_dir(tag : &str) -> GeneralResult<PathBuf> {
    let dir = std::env::temp_dir().join(format!("jpds-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[test]
fn test_classpath_file() -> GeneralResult<()> {
    let dir = scratch_dir("cpfile")?;
    let file = dir.join("classpath");
    let sep = if cfg!(windows) { ";" } else { ":" };
    std::fs::write(&file, format!("a{}b\n\nc\n", sep))?;
    let got = read_classpath_file(&file)?;
    assert_eq!(got, vec![ PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c") ]);
    std::fs::remove_dir_all(dir)?;
    Ok(())
}

#[test]
fn test_directory_lookup() -> GeneralResult<()> {
    let dir = scratch_dir("dirlookup")?;
    std::fs::create_dir_all(dir.join("pkg"))?;
    std::fs::write(dir.join("pkg").join("Foo.class"), b"\xca\xfe\xba\xbe")?;

    let cp = ClassPath::new(vec![ dir.join("missing"), dir.clone() ], None);
    assert_eq!(cp.read_bytes("pkg/Foo")?, Some(b"\xca\xfe\xba\xbe".to_vec()));
    assert_eq!(cp.read_bytes("pkg/Bar")?, None);

    std::fs::remove_dir_all(dir)?;
    Ok(())
}

#[test]
fn test_jar_lookup_indexes_once() -> GeneralResult<()> {
    use std::io::Write;

    let dir = scratch_dir("jarlookup")?;
    let jar = dir.join("classes.jar");
    let mut writer = zip::ZipWriter::new(File::create(&jar)?);
    for name in &[ "pkg/Foo.class", "pkg/Bar.class" ] {
        writer.start_file(*name, zip::write::FileOptions::default())?;
        writer.write_all(name.as_bytes())?;
    }
    writer.finish()?;

    let cp = ClassPath::new(vec![ jar.clone() ], None);
    assert_eq!(cp.read_bytes("pkg/Foo")?, Some(b"pkg/Foo.class".to_vec()));
    assert_eq!(cp.read_bytes("pkg/Bar")?, Some(b"pkg/Bar.class".to_vec()));
    assert_eq!(cp.read_bytes("pkg/Baz")?, None);
    assert_eq!(cp.archives.borrow().len(), 1);

    drop(cp);
    std::fs::remove_dir_all(dir)?;
    Ok(())
}

#[test]
fn test_memory_source() -> GeneralResult<()> {
    let class = ClassDef {
        name : "Foo".into(),
        super_name : None,
        interfaces : vec![],
        is_interface : false,
        fields : vec![],
        methods : vec![],
        annotations : vec![],
    };
    let mut source = MemorySource::new();
    source.insert(class.clone()).insert_as("stub/Foo", class);
    assert!(source.load("Foo")?.is_some());
    assert!(source.load("stub/Foo")?.is_some());
    assert!(source.load("Bar")?.is_none());
    Ok(())
}
