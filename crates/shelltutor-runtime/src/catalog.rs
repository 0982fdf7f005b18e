//! Lesson catalog.
//!
//! The catalog is an ordered, immutable list of lessons fixed at startup. A
//! lesson's identity is its position in the list.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};

/// A single lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    /// Position in the catalog.
    pub index: usize,
    /// Lesson heading.
    pub title: String,
    /// Instructional text.
    pub description: String,
    /// Command the editor is pre-filled with.
    pub starter_command: String,
    /// Fragment the captured output must contain.
    pub expected_output: String,
}

/// A lesson as written in a lesson file, before it is placed in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonSpec {
    /// Lesson heading.
    pub title: String,
    /// Instructional text.
    #[serde(default)]
    pub description: String,
    /// Command the editor is pre-filled with.
    #[serde(default)]
    pub starter_command: String,
    /// Fragment the captured output must contain.
    pub expected_output: String,
}

impl LessonSpec {
    /// Creates a lesson record.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        starter_command: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            starter_command: starter_command.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// Ordered lesson sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LessonCatalog {
    lessons: Vec<Lesson>,
}

impl LessonCatalog {
    /// Builds a catalog, assigning indices in order.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::InvalidLessons` if the list is empty or a lesson
    /// has an empty title or expected output.
    pub fn from_lessons(specs: Vec<LessonSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(TutorError::invalid_lessons("the catalog has no lessons"));
        }

        let lessons = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                if spec.title.trim().is_empty() {
                    return Err(TutorError::invalid_lessons(format!(
                        "lesson {index} has an empty title"
                    )));
                }
                // An empty fragment would let any non-empty output pass.
                if spec.expected_output.is_empty() {
                    return Err(TutorError::invalid_lessons(format!(
                        "lesson {index} ('{}') has an empty expected output",
                        spec.title
                    )));
                }
                Ok(Lesson {
                    index,
                    title: spec.title,
                    description: spec.description,
                    starter_command: spec.starter_command,
                    expected_output: spec.expected_output,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { lessons })
    }

    /// Loads a catalog from a JSON lesson file.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::LessonsNotFound` if the file is missing,
    /// `TutorError::LessonsParseError` if it is not a lesson list, and
    /// `TutorError::InvalidLessons` if a lesson is unusable.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TutorError::lessons_not_found(path)
            } else {
                TutorError::Io(e)
            }
        })?;

        let specs: Vec<LessonSpec> = serde_json::from_str(&contents)
            .map_err(|e| TutorError::lessons_parse(path, e.to_string()))?;
        Self::from_lessons(specs)
    }

    /// The built-in introductory Linux course.
    #[must_use]
    pub fn builtin() -> Self {
        let lessons = builtin_lessons()
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Lesson {
                index,
                title: spec.title,
                description: spec.description,
                starter_command: spec.starter_command,
                expected_output: spec.expected_output,
            })
            .collect();
        Self { lessons }
    }

    /// The lesson at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Lesson> {
        self.lessons.get(index)
    }

    /// Number of lessons.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lessons.len()
    }

    /// Index after `index`, or `None` at the last lesson.
    #[must_use]
    pub fn next(&self, index: usize) -> Option<usize> {
        let next = index.checked_add(1)?;
        (next < self.lessons.len()).then_some(next)
    }

    /// All lessons in order.
    #[must_use]
    pub fn lessons(&self) -> &[Lesson] {
        &self.lessons
    }
}

fn builtin_lessons() -> Vec<LessonSpec> {
    vec![
        LessonSpec::new(
            "Lesson 1: Introduction & Echo Command",
            "Welcome to Linux! In this lesson, you learn about the basic concept of a command-line interface and the echo command.\n\
             Use echo to display text on the screen. This is similar to \"print\" in other programming languages.\n\n\
             Try running the following command:",
            r#"echo "Hello, World!""#,
            "Hello, World!",
        ),
        LessonSpec::new(
            "Lesson 2: Listing Files with ls",
            "In Linux, the 'ls' command lists files and directories. The '-la' option shows hidden files and detailed information.\n\
             Study the output to understand file permissions, sizes, and timestamps.\n\n\
             Try running:",
            "ls -la",
            "total",
        ),
        LessonSpec::new(
            "Lesson 3: Creating Directories",
            "Directories (folders) in Linux organize files. The 'mkdir' command creates a new directory.\n\
             After creating a directory, listing its parent folder (with ls) lets you verify that it exists.\n\n\
             Try the following:",
            "mkdir testdir && ls -la",
            "testdir",
        ),
        LessonSpec::new(
            "Lesson 4: Creating and Displaying Files",
            "The echo command can also be used to write text into files using output redirection (>).\n\
             Then, you can read the file content with 'cat'.\n\n\
             Try this:",
            r#"echo "Hello File" > file.txt && cat file.txt"#,
            "Hello File",
        ),
        LessonSpec::new(
            "Lesson 5: Copying Files",
            "File manipulation is key in Linux. The 'cp' command copies files from one location to another.\n\
             Use this command to copy file.txt to file2.txt and then use 'cat' to check the copy.\n\n\
             Try:",
            "cp file.txt file2.txt && cat file2.txt",
            "Hello File",
        ),
        LessonSpec::new(
            "Lesson 6: Conditional Execution in Bash",
            "Bash supports conditional execution similar to other programming languages.\n\
             In this lesson, you will learn a simple if-else structure in Bash.\n\n\
             Try:",
            r#"if [ 5 -gt 3 ]; then echo "Yes"; else echo "No"; fi"#,
            "Yes",
        ),
        LessonSpec::new(
            "Lesson 7: Iteration with For Loops",
            "Loops let you repeat commands. A for loop in Bash can be used to iterate over a sequence.\n\
             Here, the loop prints numbers 1 through 5, one per line.\n\n\
             Try:",
            "for i in {1..5}; do echo $i; done",
            "1\n2\n3\n4\n5",
        ),
        LessonSpec::new(
            "Lesson 8: Appending to Files",
            "Learn how to add to an existing file without overwriting it. The '>>' operator appends text.\n\
             This lesson shows how to create a file and then add more lines.\n\n\
             Try:",
            r#"echo "First Line" > myfile.txt && echo "Second Line" >> myfile.txt && cat myfile.txt"#,
            "First Line\nSecond Line",
        ),
    ]
}
