/// Square matrix indexed `[label][prediction]`.
pub fn confusion_matrix(predictions: &[i64], labels: &[i64], num_classes: usize) -> Vec<Vec<usize>> {
    let mut matrix = vec![vec![0; num_classes]; num_classes];

    for (pred, label) in predictions.iter().zip(labels.iter()) {
        matrix[*label as usize][*pred as usize] += 1;
    }

    matrix
}

/// Rows are true classes, columns predicted ones.
pub fn format_confusion_matrix(matrix: &[Vec<usize>], class_names: &[String]) -> String {
    let width = class_names
        .iter()
        .map(|name| name.len())
        .chain(std::iter::once(9))
        .max()
        .unwrap_or(9) + 2;

    let mut out = format!("{:<width$}", "true\\pred");
    for name in class_names {
        out.push_str(&format!("{name:<width$}"));
    }
    out.push('\n');

    for (i, row) in matrix.iter().enumerate() {
        let name = class_names.get(i).map(String::as_str).unwrap_or("?");
        out.push_str(&format!("{name:<width$}"));
        for value in row {
            out.push_str(&format!("{value:<width$}"));
        }
        out.push('\n');
    }
    out
}

pub fn print_confusion_matrix(matrix: &[Vec<usize>], class_names: &[String]) {
    println!("Confusion Matrix");
    print!("{}", format_confusion_matrix(matrix, class_names));
}
