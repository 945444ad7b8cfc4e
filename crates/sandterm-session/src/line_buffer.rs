/// Characters typed since the last commit. The cursor is always at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBuffer {
    text: String,
    prompt_width: usize,
    tab_width: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(3, 4)
    }
}

impl LineBuffer {
    /// `prompt_width` is the number of columns printed before the first
    /// typed character; tab stops are counted from column zero of the line.
    pub fn new(prompt_width: usize, tab_width: usize) -> Self {
        Self {
            text: String::new(),
            prompt_width,
            tab_width: tab_width.max(1),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn push_str(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn pop(&mut self) -> Option<char> {
        self.text.pop()
    }

    /// Spaces needed to reach the next tab stop from the current column.
    pub fn tab_fill(&self) -> String {
        let column = self.len() + self.prompt_width;
        let width = self.tab_width - column % self.tab_width;
        " ".repeat(width)
    }

    /// Appends [`Self::tab_fill`] and returns what was appended.
    pub fn insert_tab(&mut self) -> String {
        let fill = self.tab_fill();
        self.text.push_str(&fill);
        fill
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}
